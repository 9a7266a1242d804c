use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::errors::Result;
use crate::metrics::EVENTS_TOTAL;
use crate::model::{Event, NewEvent};
use crate::store::Store;

pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Persists device events and fans them out to subscribers.
#[derive(Clone)]
pub struct EventBus {
    store: Arc<dyn Store>,
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(store: Arc<dyn Store>) -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { store, tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub async fn emit(&self, event: NewEvent) -> Result<Event> {
        let event = self.store.insert_event(event).await?;
        EVENTS_TOTAL
            .with_label_values(&[event.severity.as_str()])
            .inc();
        info!(
            "Event {} for device {}: {} ({})",
            event.id, event.device_id, event.event_type, event.severity
        );

        // No subscribers is fine; the event is already stored
        if self.tx.send(event.clone()).is_err() {
            debug!("No event subscribers");
        }
        Ok(event)
    }
}
