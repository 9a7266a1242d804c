use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::Result;
use crate::lifecycle::Action;
use crate::model::{
    Device, DeviceCount, DeviceLog, DevicePatch, DeviceStatus, DeviceType, Event, NewDevice,
    NewEvent, Severity, Telemetry, TelemetrySummary,
};

pub const DEFAULT_QUERY_LIMIT: usize = 100;
pub const MAX_QUERY_LIMIT: usize = 1000;

#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceFilter {
    pub status: Option<DeviceStatus>,
    pub device_type: Option<DeviceType>,
}

impl DeviceFilter {
    pub fn status(status: DeviceStatus) -> Self {
        Self {
            status: Some(status),
            device_type: None,
        }
    }

    pub fn matches(&self, device: &Device) -> bool {
        self.status.map_or(true, |s| device.status == s)
            && self.device_type.map_or(true, |t| device.device_type == t)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TelemetryFilter {
    pub device_id: Option<i64>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TelemetryFilter {
    pub fn matches(&self, t: &Telemetry) -> bool {
        self.device_id.map_or(true, |id| t.device_id == id)
            && self.start.map_or(true, |start| t.timestamp >= start)
            && self.end.map_or(true, |end| t.timestamp <= end)
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub device_id: Option<i64>,
    pub event_type: Option<String>,
    pub severity: Option<Severity>,
    pub acknowledged: Option<bool>,
}

impl EventFilter {
    pub fn matches(&self, e: &Event) -> bool {
        self.device_id.map_or(true, |id| e.device_id == id)
            && self.event_type.as_ref().map_or(true, |t| &e.event_type == t)
            && self.severity.map_or(true, |s| e.severity == s)
            && self.acknowledged.map_or(true, |a| e.acknowledged == a)
    }
}

/// Clamps a caller-supplied row limit.
pub fn query_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_QUERY_LIMIT).clamp(1, MAX_QUERY_LIMIT)
}

/// Persistence for devices, lifecycle logs, telemetry and events.
#[async_trait]
pub trait Store: Send + Sync {
    /// Fails with `Conflict` if the serial number is taken.
    async fn create_device(&self, device: NewDevice) -> Result<Device>;

    /// Devices ordered by id, plus the total number of matches.
    async fn list_devices(
        &self,
        filter: DeviceFilter,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Device>, i64)>;

    async fn get_device(&self, id: i64) -> Result<Option<Device>>;

    async fn update_device(&self, id: i64, patch: DevicePatch) -> Result<Option<Device>>;

    /// Applies a lifecycle action and records it in the device log, atomically.
    async fn apply_action(
        &self,
        id: i64,
        action: Action,
        notes: Option<String>,
    ) -> Result<(Device, DeviceLog)>;

    /// Newest first.
    async fn device_logs(&self, id: i64) -> Result<Vec<DeviceLog>>;

    /// Readings already stored for the same device and timestamp are skipped.
    async fn insert_telemetry(&self, batch: &[Telemetry]) -> Result<()>;

    /// Newest first, plus the total number of matches.
    async fn query_telemetry(
        &self,
        filter: &TelemetryFilter,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Telemetry>, i64)>;

    async fn latest_telemetry(&self, device_id: i64) -> Result<Option<Telemetry>>;

    /// Per-metric min/max/avg over one device's readings in `[start, end]`.
    async fn telemetry_summary(
        &self,
        device_id: i64,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<TelemetrySummary>;

    async fn insert_event(&self, event: NewEvent) -> Result<Event>;

    /// Newest first, plus the total number of matches.
    async fn list_events(
        &self,
        filter: &EventFilter,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Event>, i64)>;

    async fn acknowledge_event(&self, id: i64) -> Result<Option<Event>>;

    async fn device_counts(&self) -> Result<Vec<DeviceCount>>;
}
