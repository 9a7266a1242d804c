use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Value};

/// What a simulated device reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// temperature, humidity, battery
    Sensor,
    /// cpu, ram, gpu usage
    Server,
}

#[derive(Debug, Clone, Serialize)]
pub struct Telemetry {
    pub device_id: i64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_usage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ram_usage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_usage: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceEvent {
    pub device_id: i64,
    pub event_type: &'static str,
    pub details: Value,
}

const EVENT_TYPES: [&str; 3] = ["reboot", "tamper_detected", "firmware_update"];

impl Telemetry {
    pub fn generate(rng: &mut impl Rng, device_id: i64, profile: Profile) -> Self {
        let mut t = Self {
            device_id,
            timestamp: Utc::now(),
            temperature: None,
            humidity: None,
            battery: None,
            cpu_usage: None,
            ram_usage: None,
            gpu_usage: None,
        };

        match profile {
            Profile::Sensor => {
                t.temperature = Some(if rng.gen_bool(0.05) {
                    rng.gen_range(-50.0..100.0) // outliers
                } else {
                    rng.gen_range(15.0..35.0)
                });
                t.humidity = Some(if rng.gen_bool(0.05) {
                    rng.gen_range(0.0..100.0)
                } else {
                    rng.gen_range(30.0..80.0)
                });
                t.battery = Some(if rng.gen_bool(0.02) {
                    rng.gen_range(0.0..20.0) // low battery
                } else {
                    rng.gen_range(20.0..100.0)
                });
            }
            Profile::Server => {
                t.cpu_usage = Some(if rng.gen_bool(0.03) {
                    rng.gen_range(90.0..100.0) // saturated
                } else {
                    rng.gen_range(5.0..70.0)
                });
                t.ram_usage = Some(rng.gen_range(20.0..95.0));
                t.gpu_usage = Some(rng.gen_range(0.0..100.0));
            }
        }

        t
    }
}

impl DeviceEvent {
    pub fn generate(rng: &mut impl Rng, device_id: i64) -> Self {
        let event_type = EVENT_TYPES[rng.gen_range(0..EVENT_TYPES.len())];
        let details = match event_type {
            "firmware_update" => {
                let version = format!("1.{}.{}", rng.gen_range(0..10), rng.gen_range(0..50));
                json!({ "version": version })
            }
            "reboot" => json!({ "uptime_secs": rng.gen_range(60..864_000) }),
            _ => json!({ "source": "enclosure" }),
        };
        Self {
            device_id,
            event_type,
            details,
        }
    }
}
