//! Per-device health: threshold alerts and connectivity.
//!
//! Alerts are edge-triggered. A condition raises one event when it starts and
//! is re-armed once the metric is back in its normal band.

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info};

use crate::events::EventBus;
use crate::metrics::{DEVICES_OFFLINE, DEVICES_ONLINE};
use crate::model::{event_types, NewEvent, Telemetry};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    /// Battery percentage below which `low_battery` is raised.
    pub battery_low: f64,
    /// CPU percentage above which `high_cpu` is raised.
    pub cpu_high: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            battery_low: 20.0,
            cpu_high: 90.0,
        }
    }
}

#[derive(Debug, Clone)]
struct DeviceHealth {
    last_seen: DateTime<Utc>,
    offline: bool,
    low_battery: bool,
    high_cpu: bool,
}

impl DeviceHealth {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            last_seen: now,
            offline: false,
            low_battery: false,
            high_cpu: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct HealthTracker {
    thresholds: Thresholds,
    devices: Mutex<BTreeMap<i64, DeviceHealth>>,
}

impl HealthTracker {
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            thresholds,
            devices: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<i64, DeviceHealth>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a reading received at `now` and returns the events it triggers.
    pub fn observe(&self, telemetry: &Telemetry, now: DateTime<Utc>) -> Vec<NewEvent> {
        let mut events = Vec::new();
        let mut devices = self.lock();
        let state = devices
            .entry(telemetry.device_id)
            .or_insert_with(|| DeviceHealth::new(now));

        if state.offline {
            state.offline = false;
            events.push(NewEvent::new(
                telemetry.device_id,
                event_types::CONNECTION_RESTORED,
                Some(json!({ "offline_since": state.last_seen.to_rfc3339() })),
            ));
        }
        state.last_seen = now;

        if let Some(battery) = telemetry.battery {
            let low = battery < self.thresholds.battery_low;
            if low && !state.low_battery {
                events.push(NewEvent::new(
                    telemetry.device_id,
                    event_types::LOW_BATTERY,
                    Some(json!({ "battery": battery, "threshold": self.thresholds.battery_low })),
                ));
            }
            state.low_battery = low;
        }

        if let Some(cpu) = telemetry.cpu_usage {
            let high = cpu > self.thresholds.cpu_high;
            if high && !state.high_cpu {
                events.push(NewEvent::new(
                    telemetry.device_id,
                    event_types::HIGH_CPU,
                    Some(json!({ "cpu_usage": cpu, "threshold": self.thresholds.cpu_high })),
                ));
            }
            state.high_cpu = high;
        }

        events
    }

    /// Marks devices silent for longer than `timeout` as offline.
    /// Each outage yields a single `connection_lost` event.
    pub fn sweep(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<NewEvent> {
        let mut devices = self.lock();
        devices
            .iter_mut()
            .filter(|(_, state)| !state.offline && now - state.last_seen > timeout)
            .map(|(device_id, state)| {
                state.offline = true;
                NewEvent::new(
                    *device_id,
                    event_types::CONNECTION_LOST,
                    Some(json!({
                        "last_seen": state.last_seen.to_rfc3339(),
                        "timeout_secs": timeout.num_seconds(),
                    })),
                )
            })
            .collect()
    }

    /// Stops tracking a device that is no longer deployed.
    pub fn forget(&self, device_id: i64) {
        if self.lock().remove(&device_id).is_some() {
            debug!("Stopped tracking health of device {}", device_id);
        }
    }

    /// `(online, offline)` counts among tracked devices.
    pub fn connectivity(&self, now: DateTime<Utc>, timeout: Duration) -> (usize, usize) {
        let devices = self.lock();
        let online = devices
            .values()
            .filter(|s| !s.offline && now - s.last_seen <= timeout)
            .count();
        (online, devices.len() - online)
    }
}

pub async fn run_watchdog(
    tracker: Arc<HealthTracker>,
    events: EventBus,
    interval: std::time::Duration,
    timeout: Duration,
) {
    info!(
        "Starting watchdog with interval={:?}, offline_timeout={}s",
        interval,
        timeout.num_seconds()
    );

    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let now = Utc::now();

        for event in tracker.sweep(now, timeout) {
            if let Err(e) = events.emit(event).await {
                error!("Failed to record connection_lost event: {}", e);
            }
        }

        let (online, offline) = tracker.connectivity(now, timeout);
        DEVICES_ONLINE.set(online as f64);
        DEVICES_OFFLINE.set(offline as f64);
    }
}
