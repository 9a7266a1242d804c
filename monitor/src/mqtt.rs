use crate::errors::{Error, Result};
use crate::events::EventBus;
use crate::ingest::Ingest;
use crate::metrics::INVALID_MESSAGES_TOTAL;
use crate::model::{self, DeviceEventRequest, Telemetry};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 2000;

const TELEMETRY_TOPIC: &str = "telemetry/#";
const EVENTS_TOPIC: &str = "events/#";

pub async fn run_mqtt(
    broker: String,
    port: u16,
    client_id: String,
    ingest: Ingest,
    events: EventBus,
) -> Result<()> {
    info!("Connecting to MQTT broker at {}:{}", broker, port);

    let mut mqtt_options = MqttOptions::new(client_id, broker, port);
    mqtt_options.set_keep_alive(std::time::Duration::from_secs(30));
    mqtt_options.set_clean_session(false);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10000);

    for topic in [TELEMETRY_TOPIC, EVENTS_TOPIC] {
        client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(Error::Mqtt)?;
        info!("Subscribed to {} with QoS 1", topic);
    }

    tokio::spawn(forward_events(client.clone(), events.subscribe()));

    loop {
        match eventloop.poll().await {
            Ok(notification) => {
                if let Event::Incoming(Packet::Publish(publish)) = notification {
                    debug!(
                        "Received message on topic {}, size: {} bytes",
                        publish.topic,
                        publish.payload.len()
                    );

                    if let Err(e) =
                        process_message_with_retry(&publish.topic, &publish.payload, &ingest).await
                    {
                        warn!("Dropping message on {}: {}", publish.topic, e);
                        INVALID_MESSAGES_TOTAL.inc();
                    }
                }
            }
            Err(e) => {
                error!("MQTT error: {}", e);
                // rumqttc reconnects on the next poll
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }
}

/// Publishes every recorded event to `monitor/events/{device_id}`.
async fn forward_events(client: AsyncClient, mut rx: broadcast::Receiver<model::Event>) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let topic = format!("monitor/events/{}", event.device_id);
                let payload = match serde_json::to_vec(&event) {
                    Ok(payload) => payload,
                    Err(e) => {
                        error!("Failed to encode event {}: {}", event.id, e);
                        continue;
                    }
                };
                if let Err(e) = client.publish(topic, QoS::AtLeastOnce, false, payload).await {
                    warn!("Failed to publish event {}: {}", event.id, e);
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Event forwarder lagging, skipped {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => {
                info!("Event bus closed, stopping forwarder");
                return;
            }
        }
    }
}

/// Process a message with exponential backoff retry
async fn process_message_with_retry(topic: &str, payload: &[u8], ingest: &Ingest) -> Result<()> {
    let mut attempt = 0;
    let mut backoff_ms = INITIAL_BACKOFF_MS;

    loop {
        attempt += 1;

        match process_message(topic, payload, ingest).await {
            Ok(()) => {
                if attempt > 1 {
                    info!("Message processed successfully on attempt {}", attempt);
                }
                return Ok(());
            }
            Err(e) => {
                if attempt >= MAX_RETRIES || !is_retryable_error(&e) {
                    return Err(e);
                }

                warn!(
                    "Message processing failed (attempt {}/{}): {}. Retrying in {}ms...",
                    attempt, MAX_RETRIES, e, backoff_ms
                );

                tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
            }
        }
    }
}

/// Routes one publish by topic prefix.
async fn process_message(topic: &str, payload: &[u8], ingest: &Ingest) -> Result<()> {
    match topic.split_once('/') {
        Some(("telemetry", topic_id)) => {
            let telemetry = serde_json::from_slice::<Telemetry>(payload)
                .map_err(|e| Error::Validation(format!("JSON parse error: {}", e)))?;
            check_topic_id(topic_id, telemetry.device_id)?;
            ingest.accept(telemetry).await
        }
        Some(("events", topic_id)) => {
            let request = serde_json::from_slice::<DeviceEventRequest>(payload)
                .map_err(|e| Error::Validation(format!("JSON parse error: {}", e)))?;
            check_topic_id(topic_id, request.device_id)?;
            let event = ingest.report_event(request).await?;
            debug!(
                "Recorded {} event {} for device {}",
                event.event_type, event.id, event.device_id
            );
            Ok(())
        }
        _ => Err(Error::Validation(format!("Unexpected topic {}", topic))),
    }
}

/// A numeric topic suffix must name the same device as the payload.
fn check_topic_id(topic_id: &str, device_id: i64) -> Result<()> {
    match topic_id.parse::<i64>() {
        Ok(id) if id != device_id => Err(Error::Validation(format!(
            "Topic device {} does not match payload device {}",
            id, device_id
        ))),
        _ => Ok(()),
    }
}

/// Determine if an error is retryable
fn is_retryable_error(error: &Error) -> bool {
    match error {
        Error::ChannelSend => true,
        Error::Database(_) => true,

        Error::Validation(_) => false,
        Error::NotFound(_) => false,
        Error::Conflict(_) => false,
        Error::InvalidState(_) => false,
        Error::Decode(_) => false,
        Error::Mqtt(_) => false,
        Error::Json(_) => false,
        Error::Io(_) => false,
        Error::Migration(_) => false,
        Error::Metrics(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{HealthTracker, Thresholds};
    use crate::lifecycle::Action;
    use crate::memory::MemoryStore;
    use crate::model::{DeviceType, NewDevice};
    use crate::store::{EventFilter, Store};
    use chrono::Utc;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    async fn setup() -> (Ingest, Arc<MemoryStore>, mpsc::Receiver<Telemetry>) {
        let store = Arc::new(MemoryStore::new());
        store
            .create_device(NewDevice {
                name: "greenhouse sensor".to_string(),
                device_type: DeviceType::Sensor,
                serial_number: "GH-7".to_string(),
                description: None,
                location: None,
                specifications: None,
                purchase_date: None,
            })
            .await
            .unwrap();
        store
            .apply_action(1, Action::Deploy { location: "greenhouse".to_string() }, None)
            .await
            .unwrap();

        let (tx, rx) = mpsc::channel(10);
        let events = EventBus::new(store.clone());
        let health = Arc::new(HealthTracker::new(Thresholds::default()));
        (Ingest::new(store.clone(), events, health, tx), store, rx)
    }

    fn payload(temperature: f64) -> Vec<u8> {
        let mut telemetry = Telemetry::new(1, Utc::now());
        telemetry.temperature = Some(temperature);
        telemetry.humidity = Some(60.0);
        serde_json::to_vec(&telemetry).unwrap()
    }

    #[test]
    fn test_retryable_errors() {
        assert!(is_retryable_error(&Error::ChannelSend));
        assert!(!is_retryable_error(&Error::Validation("test".to_string())));
        assert!(!is_retryable_error(&Error::device_not_found(3)));
    }

    #[test]
    fn test_process_message_valid() {
        tokio_test::block_on(async {
            let (ingest, _store, mut rx) = setup().await;

            assert!(process_message("telemetry/1", &payload(25.0), &ingest).await.is_ok());

            let received = rx.recv().await.unwrap();
            assert_eq!(received.device_id, 1);
            assert_eq!(received.temperature, Some(25.0));
        });
    }

    #[test]
    fn test_process_message_topic_mismatch() {
        tokio_test::block_on(async {
            let (ingest, _store, _rx) = setup().await;
            let err = process_message("telemetry/2", &payload(25.0), &ingest)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Validation(_)));

            // non-numeric suffixes are not checked
            assert!(process_message("telemetry/greenhouse", &payload(25.0), &ingest)
                .await
                .is_ok());
        });
    }

    #[test]
    fn test_process_message_invalid_json() {
        tokio_test::block_on(async {
            let (ingest, _store, _rx) = setup().await;
            assert!(process_message("telemetry/1", b"invalid json", &ingest).await.is_err());
        });
    }

    #[test]
    fn test_process_message_invalid_temperature() {
        tokio_test::block_on(async {
            let (ingest, _store, _rx) = setup().await;
            assert!(process_message("telemetry/1", &payload(999.0), &ingest).await.is_err());
        });
    }

    #[test]
    fn test_process_device_event() {
        tokio_test::block_on(async {
            let (ingest, store, _rx) = setup().await;
            let body = br#"{"device_id": 1, "event_type": "reboot", "details": {"reason": "watchdog"}}"#;

            process_message("events/1", body, &ingest).await.unwrap();

            let (events, total) = store.list_events(&EventFilter::default(), 10, 0).await.unwrap();
            assert_eq!(total, 1);
            assert_eq!(events[0].event_type, "reboot");
            assert_eq!(events[0].severity, model::Severity::Info);
        });
    }

    #[test]
    fn test_unknown_topic_rejected() {
        tokio_test::block_on(async {
            let (ingest, _store, _rx) = setup().await;
            let err = process_message("status/1", b"{}", &ingest).await.unwrap_err();
            assert!(!is_retryable_error(&err));
        });
    }
}
