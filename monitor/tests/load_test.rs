//! Publish-rate tests against a live broker on localhost:1883.
//!
//! Readings are only accepted for devices that exist and are deployed, so
//! register and deploy ids 1..=50 first when checking end-to-end ingestion.

use chrono::Utc;
use rand::Rng;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::time::sleep;

#[derive(Debug, Clone, Serialize)]
struct Telemetry {
    device_id: i64,
    timestamp: chrono::DateTime<Utc>,
    temperature: f64,
    humidity: f64,
    battery: f64,
}

impl Telemetry {
    fn random(device_id: i64) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            device_id,
            timestamp: Utc::now(),
            temperature: rng.gen_range(15.0..35.0),
            humidity: rng.gen_range(30.0..80.0),
            battery: rng.gen_range(20.0..100.0),
        }
    }
}

struct LoadResult {
    sent: u64,
    errors: u64,
    duration: Duration,
}

impl LoadResult {
    fn rate(&self) -> f64 {
        self.sent as f64 / self.duration.as_secs_f64()
    }
}

async fn connect(client_id: &str) -> AsyncClient {
    let mut mqtt_options = MqttOptions::new(client_id, "localhost", 1883);
    mqtt_options.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 20000);
    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                eprintln!("MQTT error: {}", e);
                break;
            }
        }
    });

    sleep(Duration::from_millis(500)).await;
    client
}

async fn publish_load(client: &AsyncClient, total: u64, rate: u64, devices: i64) -> LoadResult {
    let burst_size = 100;
    let delay_per_burst = Duration::from_micros((burst_size * 1_000_000) / rate);

    let start = Instant::now();
    let mut sent = 0;
    let mut errors = 0;

    for batch_start in (0..total).step_by(burst_size as usize) {
        for i in batch_start..(batch_start + burst_size).min(total) {
            let device_id = (i as i64 % devices) + 1;
            let payload = serde_json::to_string(&Telemetry::random(device_id)).unwrap();

            match client
                .publish(
                    format!("telemetry/{}", device_id),
                    QoS::AtLeastOnce,
                    false,
                    payload,
                )
                .await
            {
                Ok(_) => sent += 1,
                Err(e) => {
                    errors += 1;
                    if errors < 10 {
                        eprintln!("Send error: {}", e);
                    }
                }
            }
        }

        sleep(delay_per_burst).await;

        let done = batch_start + burst_size;
        if done % 5000 == 0 {
            let rate = done as f64 / start.elapsed().as_secs_f64();
            println!("{} msgs ({:.0} msg/s)", done, rate);
        }
    }

    LoadResult {
        sent,
        errors,
        duration: start.elapsed(),
    }
}

#[tokio::test]
#[ignore]
async fn test_1000_messages_per_second() {
    let client = connect("monitor-load-test").await;
    let result = publish_load(&client, 10_000, 1000, 10).await;

    println!("\nResults:");
    println!("  Total Sent:     {}", result.sent);
    println!("  Errors:         {}", result.errors);
    println!("  Duration:       {:.2}s", result.duration.as_secs_f64());
    println!("  Actual Rate:    {:.2} msg/s", result.rate());

    assert!(
        result.rate() >= 900.0,
        "Throughput too low: {:.2} msg/s (expected >= 900)",
        result.rate()
    );
    assert_eq!(result.errors, 0, "Publish errors: {}", result.errors);
}

#[tokio::test]
#[ignore]
async fn test_sustained_load_60_seconds() {
    let client = connect("monitor-load-test-sustained").await;
    let result = publish_load(&client, 60_000, 1000, 50).await;

    println!("\nSustained test:");
    println!("  Total Sent:     {}", result.sent);
    println!("  Avg Rate:       {:.2} msg/s", result.rate());
    println!("  Errors:         {}", result.errors);

    assert!(result.rate() >= 900.0);
}

#[tokio::test]
#[ignore]
async fn test_device_events_accepted_by_broker() {
    let client = connect("monitor-load-test-events").await;

    for device_id in 1..=10 {
        let payload = serde_json::json!({
            "device_id": device_id,
            "event_type": "reboot",
            "details": { "uptime_secs": 0 },
        });
        client
            .publish(
                format!("events/{}", device_id),
                QoS::AtLeastOnce,
                false,
                payload.to_string(),
            )
            .await
            .unwrap();
    }

    sleep(Duration::from_millis(500)).await;
}
