use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::alerts::HealthTracker;
use crate::errors::{Error, Result};
use crate::events::EventBus;
use crate::metrics::{CHANNEL_FULL_TOTAL, TELEMETRY_TOTAL, VALID_TELEMETRY_TOTAL};
use crate::model::{DeviceEventRequest, DeviceStatus, Event, NewEvent, Severity, Telemetry};
use crate::store::Store;
use crate::validate::validate;

/// Entry point for device-originated data, shared by MQTT and HTTP.
#[derive(Clone)]
pub struct Ingest {
    store: Arc<dyn Store>,
    events: EventBus,
    health: Arc<HealthTracker>,
    tx: mpsc::Sender<Telemetry>,
}

impl Ingest {
    pub fn new(
        store: Arc<dyn Store>,
        events: EventBus,
        health: Arc<HealthTracker>,
        tx: mpsc::Sender<Telemetry>,
    ) -> Self {
        Self {
            store,
            events,
            health,
            tx,
        }
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    /// Validates a reading and queues it for the batcher.
    pub async fn accept(&self, telemetry: Telemetry) -> Result<()> {
        TELEMETRY_TOTAL.inc();
        let now = Utc::now();
        validate(&telemetry, now)?;

        let device = self
            .store
            .get_device(telemetry.device_id)
            .await?
            .ok_or_else(|| Error::device_not_found(telemetry.device_id))?;

        if device.status != DeviceStatus::Deployed {
            return Err(Error::InvalidState(
                "Device must be 'deployed' to send telemetry".to_string(),
            ));
        }

        for event in self.health.observe(&telemetry, now) {
            if let Err(e) = self.events.emit(event).await {
                warn!("Failed to record alert for device {}: {}", device.id, e);
            }
        }

        self.enqueue(telemetry).await
    }

    async fn enqueue(&self, telemetry: Telemetry) -> Result<()> {
        match self.tx.try_send(telemetry) {
            Ok(()) => {
                VALID_TELEMETRY_TOTAL.inc();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(telemetry)) => {
                CHANNEL_FULL_TOTAL.inc();
                debug!("Channel full, using blocking send");
                self.tx
                    .send(telemetry)
                    .await
                    .map_err(|_| Error::ChannelSend)?;
                VALID_TELEMETRY_TOTAL.inc();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!("Channel closed, cannot send telemetry");
                Err(Error::ChannelSend)
            }
        }
    }

    /// Records an event reported by a device.
    pub async fn report_event(&self, request: DeviceEventRequest) -> Result<Event> {
        let event_type = request.event_type.trim();
        if event_type.is_empty() {
            return Err(Error::Validation("Event type cannot be empty".to_string()));
        }

        if self.store.get_device(request.device_id).await?.is_none() {
            return Err(Error::device_not_found(request.device_id));
        }

        let severity = request
            .severity
            .unwrap_or_else(|| Severity::for_event_type(event_type));

        self.events
            .emit(NewEvent {
                device_id: request.device_id,
                event_type: event_type.to_string(),
                severity,
                details: request.details,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::Thresholds;
    use crate::lifecycle::Action;
    use crate::memory::MemoryStore;
    use crate::model::{DeviceType, NewDevice};
    use crate::store::EventFilter;

    async fn setup(capacity: usize) -> (Ingest, Arc<MemoryStore>, mpsc::Receiver<Telemetry>) {
        let store = Arc::new(MemoryStore::new());
        for serial in ["ING-1", "ING-2"] {
            store
                .create_device(NewDevice {
                    name: serial.to_lowercase(),
                    device_type: DeviceType::Sensor,
                    serial_number: serial.to_string(),
                    description: None,
                    location: None,
                    specifications: None,
                    purchase_date: None,
                })
                .await
                .unwrap();
        }
        store
            .apply_action(1, Action::Deploy { location: "yard".to_string() }, None)
            .await
            .unwrap();

        let (tx, rx) = mpsc::channel(capacity);
        let events = EventBus::new(store.clone());
        let health = Arc::new(HealthTracker::new(Thresholds::default()));
        (Ingest::new(store.clone(), events, health, tx), store, rx)
    }

    fn reading(device_id: i64, battery: f64) -> Telemetry {
        let mut t = Telemetry::new(device_id, Utc::now());
        t.battery = Some(battery);
        t
    }

    #[tokio::test]
    async fn test_accept_deployed_device() {
        let (ingest, _store, mut rx) = setup(10).await;
        ingest.accept(reading(1, 77.0)).await.unwrap();

        let queued = rx.recv().await.unwrap();
        assert_eq!(queued.device_id, 1);
        assert_eq!(queued.battery, Some(77.0));
    }

    #[tokio::test]
    async fn test_reject_undeployed_and_unknown() {
        let (ingest, _store, _rx) = setup(10).await;

        let err = ingest.accept(reading(2, 77.0)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));

        let err = ingest.accept(reading(9, 77.0)).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let err = ingest.accept(reading(1, 177.0)).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_low_battery_recorded() {
        let (ingest, store, _rx) = setup(10).await;
        ingest.accept(reading(1, 5.0)).await.unwrap();

        let (events, total) = store.list_events(&EventFilter::default(), 10, 0).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(events[0].event_type, "low_battery");
        assert_eq!(events[0].severity, Severity::Warning);
    }

    #[tokio::test]
    async fn test_closed_channel() {
        let (ingest, _store, rx) = setup(10).await;
        drop(rx);
        let err = ingest.accept(reading(1, 60.0)).await.unwrap_err();
        assert!(matches!(err, Error::ChannelSend));
    }

    #[tokio::test]
    async fn test_report_event_severity() {
        let (ingest, _store, _rx) = setup(10).await;

        let event = ingest
            .report_event(DeviceEventRequest {
                device_id: 2,
                event_type: "tamper_detected".to_string(),
                severity: Some(Severity::Critical),
                details: None,
            })
            .await
            .unwrap();
        assert_eq!(event.severity, Severity::Critical);

        let event = ingest
            .report_event(DeviceEventRequest {
                device_id: 2,
                event_type: "reboot".to_string(),
                severity: None,
                details: None,
            })
            .await
            .unwrap();
        assert_eq!(event.severity, Severity::Info);

        let err = ingest
            .report_event(DeviceEventRequest {
                device_id: 40,
                event_type: "reboot".to_string(),
                severity: None,
                details: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
