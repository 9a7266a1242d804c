//! In-process store for tests and database-less runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use crate::errors::{Error, Result};
use crate::lifecycle::{self, Action};
use crate::model::{
    Device, DeviceCount, DeviceLog, DevicePatch, DeviceStatus, Event, Metric, MetricSummary,
    NewDevice, NewEvent, Telemetry, TelemetrySummary,
};
use crate::store::{DeviceFilter, EventFilter, Store, TelemetryFilter};

#[derive(Debug, Default)]
struct Inner {
    devices: BTreeMap<i64, Device>,
    logs: Vec<DeviceLog>,
    telemetry: BTreeMap<(i64, DateTime<Utc>), Telemetry>,
    events: BTreeMap<i64, Event>,
    last_device_id: i64,
    last_log_id: i64,
    last_event_id: i64,
}

fn next_id(last: &mut i64) -> i64 {
    *last += 1;
    *last
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn page<T>(items: Vec<T>, limit: usize, offset: usize) -> (Vec<T>, i64) {
    let total = items.len() as i64;
    let page = items.into_iter().skip(offset).take(limit).collect();
    (page, total)
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_device(&self, new: NewDevice) -> Result<Device> {
        let mut inner = self.inner.write().await;

        if inner
            .devices
            .values()
            .any(|d| d.serial_number == new.serial_number)
        {
            return Err(Error::Conflict(
                "Device with this serial number already exists".to_string(),
            ));
        }

        let now = Utc::now();
        let device = Device {
            id: next_id(&mut inner.last_device_id),
            name: new.name,
            device_type: new.device_type,
            serial_number: new.serial_number,
            description: new.description,
            status: DeviceStatus::InStock,
            location: new.location,
            specifications: new.specifications,
            purchase_date: new.purchase_date,
            deploy_date: None,
            last_maintenance_date: None,
            created_at: now,
            updated_at: now,
        };
        inner.devices.insert(device.id, device.clone());
        Ok(device)
    }

    async fn list_devices(
        &self,
        filter: DeviceFilter,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Device>, i64)> {
        let inner = self.inner.read().await;
        let matching: Vec<Device> = inner
            .devices
            .values()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect();
        Ok(page(matching, limit, offset))
    }

    async fn get_device(&self, id: i64) -> Result<Option<Device>> {
        Ok(self.inner.read().await.devices.get(&id).cloned())
    }

    async fn update_device(&self, id: i64, patch: DevicePatch) -> Result<Option<Device>> {
        let mut inner = self.inner.write().await;
        let Some(device) = inner.devices.get_mut(&id) else {
            return Ok(None);
        };
        patch.apply_to(device);
        device.updated_at = Utc::now();
        Ok(Some(device.clone()))
    }

    async fn apply_action(
        &self,
        id: i64,
        action: Action,
        notes: Option<String>,
    ) -> Result<(Device, DeviceLog)> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();

        let device = inner
            .devices
            .get_mut(&id)
            .ok_or_else(|| Error::device_not_found(id))?;
        let old_status = device.status;
        lifecycle::apply(device, &action, now)?;
        let device = device.clone();

        let log = DeviceLog {
            id: next_id(&mut inner.last_log_id),
            device_id: id,
            action: action.log_name().to_string(),
            old_status: Some(old_status),
            new_status: Some(device.status),
            notes,
            created_at: now,
        };
        inner.logs.push(log.clone());

        Ok((device, log))
    }

    async fn device_logs(&self, id: i64) -> Result<Vec<DeviceLog>> {
        let inner = self.inner.read().await;
        Ok(inner
            .logs
            .iter()
            .rev()
            .filter(|l| l.device_id == id)
            .cloned()
            .collect())
    }

    async fn insert_telemetry(&self, batch: &[Telemetry]) -> Result<()> {
        let mut inner = self.inner.write().await;
        for t in batch {
            inner
                .telemetry
                .entry((t.device_id, t.timestamp))
                .or_insert_with(|| t.clone());
        }
        Ok(())
    }

    async fn query_telemetry(
        &self,
        filter: &TelemetryFilter,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Telemetry>, i64)> {
        let inner = self.inner.read().await;
        let mut matching: Vec<Telemetry> = inner
            .telemetry
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(page(matching, limit, offset))
    }

    async fn latest_telemetry(&self, device_id: i64) -> Result<Option<Telemetry>> {
        let inner = self.inner.read().await;
        Ok(inner
            .telemetry
            .range((device_id, DateTime::<Utc>::MIN_UTC)..=(device_id, DateTime::<Utc>::MAX_UTC))
            .next_back()
            .map(|(_, t)| t.clone()))
    }

    async fn telemetry_summary(
        &self,
        device_id: i64,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<TelemetrySummary> {
        let filter = TelemetryFilter {
            device_id: Some(device_id),
            start,
            end,
        };
        let inner = self.inner.read().await;

        let mut samples = 0;
        let mut sums: BTreeMap<Metric, (f64, f64, f64, i64)> = BTreeMap::new();
        for t in inner.telemetry.values().filter(|t| filter.matches(t)) {
            samples += 1;
            for (metric, value) in t.metrics() {
                let entry = sums
                    .entry(metric)
                    .or_insert((f64::INFINITY, f64::NEG_INFINITY, 0.0, 0));
                entry.0 = entry.0.min(value);
                entry.1 = entry.1.max(value);
                entry.2 += value;
                entry.3 += 1;
            }
        }

        let metrics = sums
            .into_iter()
            .map(|(metric, (min, max, sum, count))| {
                let avg = sum / count as f64;
                (metric, MetricSummary { min, max, avg, count })
            })
            .collect();

        Ok(TelemetrySummary {
            device_id,
            start,
            end,
            samples,
            metrics,
        })
    }

    async fn insert_event(&self, new: NewEvent) -> Result<Event> {
        let mut inner = self.inner.write().await;
        let event = Event {
            id: next_id(&mut inner.last_event_id),
            device_id: new.device_id,
            event_type: new.event_type,
            severity: new.severity,
            details: new.details,
            acknowledged: false,
            created_at: Utc::now(),
        };
        inner.events.insert(event.id, event.clone());
        Ok(event)
    }

    async fn list_events(
        &self,
        filter: &EventFilter,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Event>, i64)> {
        let inner = self.inner.read().await;
        // ids ascend with insertion, so reverse id order is newest first
        let matching: Vec<Event> = inner
            .events
            .values()
            .rev()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        Ok(page(matching, limit, offset))
    }

    async fn acknowledge_event(&self, id: i64) -> Result<Option<Event>> {
        let mut inner = self.inner.write().await;
        Ok(inner.events.get_mut(&id).map(|e| {
            e.acknowledged = true;
            e.clone()
        }))
    }

    async fn device_counts(&self) -> Result<Vec<DeviceCount>> {
        let inner = self.inner.read().await;
        let mut counts: BTreeMap<_, i64> = BTreeMap::new();
        for d in inner.devices.values() {
            *counts.entry((d.status, d.device_type)).or_insert(0) += 1;
        }
        Ok(counts
            .into_iter()
            .map(|((status, device_type), count)| DeviceCount {
                status,
                device_type,
                count,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeviceType, Severity};
    use chrono::Duration;

    fn new_device(serial: &str) -> NewDevice {
        NewDevice {
            name: format!("device {}", serial),
            device_type: DeviceType::Sensor,
            serial_number: serial.to_string(),
            description: None,
            location: Some("warehouse".to_string()),
            specifications: None,
            purchase_date: None,
        }
    }

    fn reading(device_id: i64, ts: DateTime<Utc>, battery: f64) -> Telemetry {
        let mut t = Telemetry::new(device_id, ts);
        t.battery = Some(battery);
        t
    }

    #[tokio::test]
    async fn test_duplicate_serial_conflicts() {
        let store = MemoryStore::new();
        let first = store.create_device(new_device("A-1")).await.unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(first.status, DeviceStatus::InStock);

        let err = store.create_device(new_device("A-1")).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_list_devices_filters_and_pages() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.create_device(new_device(&format!("S-{}", i))).await.unwrap();
        }
        store
            .apply_action(2, Action::Deploy { location: "roof".to_string() }, None)
            .await
            .unwrap();

        let (page, total) = store.list_devices(DeviceFilter::default(), 2, 2).await.unwrap();
        assert_eq!(total, 5);
        assert_eq!(page.iter().map(|d| d.id).collect::<Vec<_>>(), vec![3, 4]);

        let (deployed, total) = store
            .list_devices(DeviceFilter::status(DeviceStatus::Deployed), 20, 0)
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(deployed[0].id, 2);
    }

    #[tokio::test]
    async fn test_apply_action_logs_and_rejects() {
        let store = MemoryStore::new();
        let device = store.create_device(new_device("L-1")).await.unwrap();

        let (updated, log) = store
            .apply_action(device.id, Action::Reserve, Some("order 77".to_string()))
            .await
            .unwrap();
        assert_eq!(updated.status, DeviceStatus::Reserved);
        assert_eq!(log.action, "reserved");
        assert_eq!(log.old_status, Some(DeviceStatus::InStock));
        assert_eq!(log.notes.as_deref(), Some("order 77"));

        let err = store
            .apply_action(device.id, Action::Recall { location: None }, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));

        let err = store.apply_action(99, Action::Retire, None).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let logs = store.device_logs(device.id).await.unwrap();
        assert_eq!(logs.len(), 1);
    }

    #[tokio::test]
    async fn test_update_device_is_partial() {
        let store = MemoryStore::new();
        let device = store.create_device(new_device("U-1")).await.unwrap();

        let patch = DevicePatch {
            description: Some("north wall".to_string()),
            ..Default::default()
        };
        let updated = store.update_device(device.id, patch).await.unwrap().unwrap();
        assert_eq!(updated.description.as_deref(), Some("north wall"));
        assert_eq!(updated.name, device.name);
        assert_eq!(updated.location, device.location);

        assert!(store.update_device(42, DevicePatch::default()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_telemetry_dedup_order_and_latest() {
        let store = MemoryStore::new();
        let base = Utc::now() - Duration::minutes(10);
        let batch = vec![
            reading(1, base, 90.0),
            reading(1, base + Duration::minutes(1), 89.0),
            reading(1, base, 10.0),
            reading(2, base + Duration::minutes(2), 50.0),
        ];
        store.insert_telemetry(&batch).await.unwrap();

        let filter = TelemetryFilter {
            device_id: Some(1),
            ..Default::default()
        };
        let (rows, total) = store.query_telemetry(&filter, 100, 0).await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(rows[0].battery, Some(89.0));
        assert_eq!(rows[1].battery, Some(90.0));

        let latest = store.latest_telemetry(1).await.unwrap().unwrap();
        assert_eq!(latest.timestamp, base + Duration::minutes(1));
        assert!(store.latest_telemetry(3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_telemetry_summary() {
        let store = MemoryStore::new();
        let base = Utc::now() - Duration::hours(1);
        let mut hot = reading(1, base, 40.0);
        hot.temperature = Some(30.0);
        let mut cold = reading(1, base + Duration::minutes(5), 60.0);
        cold.temperature = Some(10.0);
        store
            .insert_telemetry(&[hot, cold, reading(1, base + Duration::minutes(9), 80.0)])
            .await
            .unwrap();

        let summary = store.telemetry_summary(1, None, None).await.unwrap();
        assert_eq!(summary.samples, 3);

        let battery = summary.metrics[&Metric::Battery];
        assert_eq!(battery.min, 40.0);
        assert_eq!(battery.max, 80.0);
        assert_eq!(battery.avg, 60.0);
        assert_eq!(battery.count, 3);

        let temperature = summary.metrics[&Metric::Temperature];
        assert_eq!(temperature.count, 2);
        assert_eq!(temperature.avg, 20.0);
        assert!(!summary.metrics.contains_key(&Metric::CpuUsage));

        let windowed = store
            .telemetry_summary(1, Some(base + Duration::minutes(1)), None)
            .await
            .unwrap();
        assert_eq!(windowed.samples, 2);
    }

    #[tokio::test]
    async fn test_events_filter_and_acknowledge() {
        let store = MemoryStore::new();
        store
            .insert_event(NewEvent::new(1, "low_battery", None))
            .await
            .unwrap();
        let lost = store
            .insert_event(NewEvent::new(2, "connection_lost", None))
            .await
            .unwrap();
        assert_eq!(lost.severity, Severity::Critical);

        let (all, total) = store.list_events(&EventFilter::default(), 10, 0).await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(all[0].id, lost.id);

        store.acknowledge_event(lost.id).await.unwrap().unwrap();
        let open = EventFilter {
            acknowledged: Some(false),
            ..Default::default()
        };
        let (events, total) = store.list_events(&open, 10, 0).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(events[0].event_type, "low_battery");

        assert!(store.acknowledge_event(99).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_device_counts() {
        let store = MemoryStore::new();
        store.create_device(new_device("C-1")).await.unwrap();
        store.create_device(new_device("C-2")).await.unwrap();
        store.apply_action(1, Action::Retire, None).await.unwrap();

        let counts = store.device_counts().await.unwrap();
        assert_eq!(counts.len(), 2);
        assert!(counts
            .iter()
            .any(|c| c.status == DeviceStatus::Retired && c.count == 1));
    }
}
