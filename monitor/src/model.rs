use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::errors::Error;

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(Error::Decode(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Sensor,
    Actuator,
    Gateway,
    Computer,
    Server,
    Other,
}

text_enum!(DeviceType {
    Sensor => "sensor",
    Actuator => "actuator",
    Gateway => "gateway",
    Computer => "computer",
    Server => "server",
    Other => "other",
});

/// Inventory lifecycle position of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    InStock,
    Reserved,
    Deployed,
    Maintenance,
    Retired,
}

text_enum!(DeviceStatus {
    InStock => "in_stock",
    Reserved => "reserved",
    Deployed => "deployed",
    Maintenance => "maintenance",
    Retired => "retired",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

text_enum!(Severity {
    Info => "info",
    Warning => "warning",
    Critical => "critical",
});

impl Severity {
    /// Default severity for an event type when the reporter does not supply one.
    pub fn for_event_type(event_type: &str) -> Self {
        match event_type {
            event_types::CONNECTION_LOST => Severity::Critical,
            event_types::LOW_BATTERY | event_types::HIGH_CPU => Severity::Warning,
            _ => Severity::Info,
        }
    }
}

/// Event types raised by the platform itself.
pub mod event_types {
    pub const LOW_BATTERY: &str = "low_battery";
    pub const HIGH_CPU: &str = "high_cpu";
    pub const CONNECTION_LOST: &str = "connection_lost";
    pub const CONNECTION_RESTORED: &str = "connection_restored";
    pub const DEVICE_RESERVED: &str = "device_reserved";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    pub serial_number: String,
    pub description: Option<String>,
    pub status: DeviceStatus,
    pub location: Option<String>,
    pub specifications: Option<Value>,
    pub purchase_date: Option<NaiveDate>,
    pub deploy_date: Option<DateTime<Utc>>,
    pub last_maintenance_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Registration request for a new device
#[derive(Debug, Clone, Deserialize)]
pub struct NewDevice {
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    pub serial_number: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub specifications: Option<Value>,
    pub purchase_date: Option<NaiveDate>,
}

/// Partial update; absent fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DevicePatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub specifications: Option<Value>,
}

impl DevicePatch {
    pub fn apply_to(&self, device: &mut Device) {
        if let Some(name) = &self.name {
            device.name = name.clone();
        }
        if let Some(description) = &self.description {
            device.description = Some(description.clone());
        }
        if let Some(location) = &self.location {
            device.location = Some(location.clone());
        }
        if let Some(specifications) = &self.specifications {
            device.specifications = Some(specifications.clone());
        }
    }
}

/// Lifecycle audit entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceLog {
    pub id: i64,
    pub device_id: i64,
    pub action: String,
    pub old_status: Option<DeviceStatus>,
    pub new_status: Option<DeviceStatus>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Device telemetry reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Telemetry {
    pub device_id: i64,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub battery: Option<f64>,
    pub cpu_usage: Option<f64>,
    pub ram_usage: Option<f64>,
    pub gpu_usage: Option<f64>,
}

impl Telemetry {
    pub fn new(device_id: i64, timestamp: DateTime<Utc>) -> Self {
        Self {
            device_id,
            timestamp,
            temperature: None,
            humidity: None,
            battery: None,
            cpu_usage: None,
            ram_usage: None,
            gpu_usage: None,
        }
    }

    /// Present metrics in `Metric::ALL` order.
    pub fn metrics(&self) -> impl Iterator<Item = (Metric, f64)> + '_ {
        Metric::ALL
            .into_iter()
            .filter_map(move |m| m.value(self).map(|v| (m, v)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Temperature,
    Humidity,
    Battery,
    CpuUsage,
    RamUsage,
    GpuUsage,
}

impl Metric {
    pub const ALL: [Metric; 6] = [
        Metric::Temperature,
        Metric::Humidity,
        Metric::Battery,
        Metric::CpuUsage,
        Metric::RamUsage,
        Metric::GpuUsage,
    ];

    /// Column name in the telemetry table. Also used in messages.
    pub fn column(&self) -> &'static str {
        match self {
            Metric::Temperature => "temperature",
            Metric::Humidity => "humidity",
            Metric::Battery => "battery",
            Metric::CpuUsage => "cpu_usage",
            Metric::RamUsage => "ram_usage",
            Metric::GpuUsage => "gpu_usage",
        }
    }

    pub fn value(&self, telemetry: &Telemetry) -> Option<f64> {
        match self {
            Metric::Temperature => telemetry.temperature,
            Metric::Humidity => telemetry.humidity,
            Metric::Battery => telemetry.battery,
            Metric::CpuUsage => telemetry.cpu_usage,
            Metric::RamUsage => telemetry.ram_usage,
            Metric::GpuUsage => telemetry.gpu_usage,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricSummary {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySummary {
    pub device_id: i64,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub samples: i64,
    pub metrics: BTreeMap<Metric, MetricSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub device_id: i64,
    pub event_type: String,
    pub severity: Severity,
    pub details: Option<Value>,
    pub acknowledged: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub device_id: i64,
    pub event_type: String,
    pub severity: Severity,
    pub details: Option<Value>,
}

impl NewEvent {
    /// Event with the default severity for its type.
    pub fn new(device_id: i64, event_type: &str, details: Option<Value>) -> Self {
        Self {
            device_id,
            event_type: event_type.to_string(),
            severity: Severity::for_event_type(event_type),
            details,
        }
    }
}

/// Event reported by a device, over MQTT or HTTP
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceEventRequest {
    pub device_id: i64,
    pub event_type: String,
    pub severity: Option<Severity>,
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCount {
    pub status: DeviceStatus,
    pub device_type: DeviceType,
    pub count: i64,
}

/// Paginated list response
#[derive(Debug, Serialize)]
pub struct Paged<T> {
    pub data: Vec<T>,
    pub total: i64,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Serialize)]
pub struct DeviceListResponse {
    pub devices: Vec<Device>,
    pub total: i64,
    pub page: usize,
    pub page_size: usize,
}

#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<Device>,
}

impl ActionResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            device: None,
        }
    }

    pub fn with_device(message: impl Into<String>, device: Device) -> Self {
        Self {
            success: true,
            message: message.into(),
            device: Some(device),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DashboardSummary {
    pub total_devices: i64,
    pub by_status: BTreeMap<DeviceStatus, i64>,
    pub by_type: BTreeMap<DeviceType, i64>,
    pub online_devices: usize,
    pub offline_devices: usize,
    pub unacknowledged_events: i64,
    pub recent_events: Vec<Event>,
}

impl DashboardSummary {
    pub fn from_counts(counts: &[DeviceCount]) -> Self {
        let mut by_status: BTreeMap<DeviceStatus, i64> =
            DeviceStatus::ALL.iter().map(|s| (*s, 0)).collect();
        let mut by_type = BTreeMap::new();
        let mut total_devices = 0;

        for c in counts {
            *by_status.entry(c.status).or_insert(0) += c.count;
            *by_type.entry(c.device_type).or_insert(0) += c.count;
            total_devices += c.count;
        }

        Self {
            total_devices,
            by_status,
            by_type,
            online_devices: 0,
            offline_devices: 0,
            unacknowledged_events: 0,
            recent_events: Vec::new(),
        }
    }
}
