mod telemetry;

use clap::Parser;
use rand::Rng;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde::Serialize;
use std::time::Duration;
use telemetry::{DeviceEvent, Profile, Telemetry};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const BURST_SIZE: u64 = 200;

/// Publishes simulated device telemetry and events over MQTT
#[derive(Debug, Parser)]
#[command(name = "simulator", version, about)]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    mqtt_broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    mqtt_port: u16,

    /// Messages per second
    #[arg(long, env = "RATE", default_value_t = 1000)]
    rate: u64,

    #[arg(long, env = "DEVICES", default_value_t = 100)]
    devices: u64,

    #[arg(long, default_value_t = 1)]
    first_device_id: i64,

    /// Number of ids at the end of the range that report CPU/RAM/GPU
    #[arg(long, default_value_t = 10)]
    servers: u64,

    /// Chance per reading that the device also reports an event
    #[arg(long, default_value_t = 0.001)]
    event_probability: f64,
}

impl Args {
    fn device(&self, counter: u64) -> (i64, Profile) {
        let index = counter % self.devices;
        let profile = if index >= self.devices.saturating_sub(self.servers) {
            Profile::Server
        } else {
            Profile::Sensor
        };
        (self.first_device_id + index as i64, profile)
    }
}

async fn publish_json<T: Serialize>(client: &AsyncClient, topic: String, message: &T) -> bool {
    let payload = match serde_json::to_string(message) {
        Ok(p) => p,
        Err(e) => {
            error!("Failed to serialize message: {}", e);
            return false;
        }
    };

    match client.publish(&topic, QoS::AtLeastOnce, false, payload).await {
        Ok(_) => true,
        Err(e) => {
            warn!("Failed to publish to {}: {}", topic, e);
            false
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("simulator=info")),
        )
        .init();

    info!("Starting IoT Simulator");
    info!(
        "Broker: {}:{}, Rate: {} msg/s, Devices: {} (ids {}..), Servers: {}",
        args.mqtt_broker,
        args.mqtt_port,
        args.rate,
        args.devices,
        args.first_device_id,
        args.servers
    );

    if args.devices == 0 || args.rate == 0 {
        error!("--devices and --rate must be greater than zero");
        std::process::exit(2);
    }
    let event_probability = args.event_probability.clamp(0.0, 1.0);

    let client_id = format!("sim-{}", uuid::Uuid::new_v4());

    let mut mqtt_options = MqttOptions::new(&client_id, &args.mqtt_broker, args.mqtt_port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 20000);

    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                error!("MQTT eventloop error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(2)).await;

    info!("Connected to MQTT broker, starting to publish telemetry");

    let mut rng = rand::thread_rng();
    let mut counter = 0u64;
    let mut events_sent = 0u64;

    let burst_interval = Duration::from_millis((BURST_SIZE * 1000) / args.rate);
    info!("Publishing in bursts of {} messages every {:?}", BURST_SIZE, burst_interval);

    loop {
        let burst_start = std::time::Instant::now();

        for _ in 0..BURST_SIZE {
            let (device_id, profile) = args.device(counter);
            let reading = Telemetry::generate(&mut rng, device_id, profile);

            if publish_json(&client, format!("telemetry/{}", device_id), &reading).await {
                counter += 1;
            }

            if rng.gen_bool(event_probability) {
                let event = DeviceEvent::generate(&mut rng, device_id);
                if publish_json(&client, format!("events/{}", device_id), &event).await {
                    events_sent += 1;
                }
            }
        }

        if counter % 10000 == 0 {
            info!("Published {} readings, {} events", counter, events_sent);
        }

        let elapsed = burst_start.elapsed();
        if elapsed < burst_interval {
            tokio::time::sleep(burst_interval - elapsed).await;
        } else if elapsed > burst_interval * 2 {
            warn!(
                "Burst took {:?}, target was {:?} - system may be overloaded",
                elapsed, burst_interval
            );
        }
    }
}
