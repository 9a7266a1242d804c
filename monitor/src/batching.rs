use crate::metrics::{BATCH_SIZE, INGEST_LATENCY_SECONDS};
use crate::model::Telemetry;
use crate::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant};
use tracing::{debug, error, info};

/// Retries after the first failed insert; the batch is dropped once these run out.
const MAX_RETRIES: u32 = 3;

pub async fn run_batcher(
    mut rx: mpsc::Receiver<Telemetry>,
    store: Arc<dyn Store>,
    max_batch: usize,
    max_wait_ms: u64,
) {
    info!(
        "Starting batcher with max_batch={}, max_wait_ms={}",
        max_batch, max_wait_ms
    );

    let mut buffer: Vec<Telemetry> = Vec::with_capacity(max_batch);
    let mut ticker = interval(Duration::from_millis(max_wait_ms.max(1)));

    loop {
        tokio::select! {
            telemetry = rx.recv() => {
                match telemetry {
                    Some(t) => {
                        buffer.push(t);

                        if buffer.len() >= max_batch {
                            flush_batch(store.as_ref(), &mut buffer).await;
                        }
                    }
                    None => {
                        info!("Channel closed, flushing remaining batch");
                        flush_batch(store.as_ref(), &mut buffer).await;
                        break;
                    }
                }
            }

            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush_batch(store.as_ref(), &mut buffer).await;
                }
            }
        }
    }

    info!("Batcher stopped");
}

async fn flush_batch(store: &dyn Store, buffer: &mut Vec<Telemetry>) {
    let batch_len = buffer.len();
    if batch_len == 0 {
        return;
    }

    debug!("Flushing batch of {} records", batch_len);
    BATCH_SIZE.set(batch_len as f64);

    let start = Instant::now();
    let mut attempt = 0;

    loop {
        attempt += 1;

        match store.insert_telemetry(buffer).await {
            Ok(()) => {
                let elapsed = start.elapsed().as_secs_f64();
                INGEST_LATENCY_SECONDS.observe(elapsed);
                if attempt > 1 {
                    info!(
                        "Batch inserted successfully after {} attempts in {:.3}s",
                        attempt, elapsed
                    );
                } else {
                    debug!("Batch inserted successfully in {:.3}s", elapsed);
                }
                buffer.clear();
                BATCH_SIZE.set(0.0);
                return;
            }
            Err(e) => {
                if attempt > MAX_RETRIES {
                    error!("Failed to insert batch after {} attempts: {}", attempt, e);
                    error!(
                        "CRITICAL: {} records will be dropped due to persistent DB failure",
                        batch_len
                    );
                    buffer.clear();
                    BATCH_SIZE.set(0.0);
                    return;
                }

                // retry 1: 100ms, retry 2: 200ms, retry 3: 400ms
                let backoff_ms = 100 * 2_u64.pow(attempt - 1);
                error!(
                    "Failed to insert batch (attempt {}/{}): {}. Retrying in {}ms...",
                    attempt,
                    MAX_RETRIES + 1,
                    e,
                    backoff_ms
                );

                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{Error, Result};
    use crate::lifecycle::Action;
    use crate::memory::MemoryStore;
    use crate::model::{
        Device, DeviceCount, DeviceLog, DevicePatch, Event, NewDevice, NewEvent,
        TelemetrySummary,
    };
    use crate::store::{DeviceFilter, EventFilter, TelemetryFilter};
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` telemetry inserts, then accepts them.
    struct FlakyStore {
        failures: usize,
        inserts: AtomicUsize,
    }

    impl FlakyStore {
        fn new(failures: usize) -> Self {
            Self {
                failures,
                inserts: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Store for FlakyStore {
        async fn create_device(&self, _device: NewDevice) -> Result<Device> {
            unimplemented!()
        }

        async fn list_devices(
            &self,
            _filter: DeviceFilter,
            _limit: usize,
            _offset: usize,
        ) -> Result<(Vec<Device>, i64)> {
            unimplemented!()
        }

        async fn get_device(&self, _id: i64) -> Result<Option<Device>> {
            unimplemented!()
        }

        async fn update_device(&self, _id: i64, _patch: DevicePatch) -> Result<Option<Device>> {
            unimplemented!()
        }

        async fn apply_action(
            &self,
            _id: i64,
            _action: Action,
            _notes: Option<String>,
        ) -> Result<(Device, DeviceLog)> {
            unimplemented!()
        }

        async fn device_logs(&self, _id: i64) -> Result<Vec<DeviceLog>> {
            unimplemented!()
        }

        async fn insert_telemetry(&self, _batch: &[Telemetry]) -> Result<()> {
            let call = self.inserts.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                Err(Error::ChannelSend)
            } else {
                Ok(())
            }
        }

        async fn query_telemetry(
            &self,
            _filter: &TelemetryFilter,
            _limit: usize,
            _offset: usize,
        ) -> Result<(Vec<Telemetry>, i64)> {
            unimplemented!()
        }

        async fn latest_telemetry(&self, _device_id: i64) -> Result<Option<Telemetry>> {
            unimplemented!()
        }

        async fn telemetry_summary(
            &self,
            _device_id: i64,
            _start: Option<DateTime<Utc>>,
            _end: Option<DateTime<Utc>>,
        ) -> Result<TelemetrySummary> {
            unimplemented!()
        }

        async fn insert_event(&self, _event: NewEvent) -> Result<Event> {
            unimplemented!()
        }

        async fn list_events(
            &self,
            _filter: &EventFilter,
            _limit: usize,
            _offset: usize,
        ) -> Result<(Vec<Event>, i64)> {
            unimplemented!()
        }

        async fn acknowledge_event(&self, _id: i64) -> Result<Option<Event>> {
            unimplemented!()
        }

        async fn device_counts(&self) -> Result<Vec<DeviceCount>> {
            unimplemented!()
        }
    }

    fn pending_batch() -> Vec<Telemetry> {
        let mut t = Telemetry::new(3, Utc::now());
        t.battery = Some(50.0);
        vec![t]
    }

    #[tokio::test]
    async fn test_flushes_on_size_and_close() {
        let store = Arc::new(MemoryStore::new());
        let (tx, rx) = mpsc::channel(100);
        let handle = tokio::spawn(run_batcher(rx, store.clone(), 3, 10_000));

        let base = Utc::now();
        for i in 0..5 {
            let mut t = Telemetry::new(1, base - ChronoDuration::seconds(i));
            t.temperature = Some(20.0 + i as f64);
            tx.send(t).await.unwrap();
        }
        drop(tx);
        handle.await.unwrap();

        let (rows, total) = store
            .query_telemetry(&TelemetryFilter::default(), 100, 0)
            .await
            .unwrap();
        assert_eq!(total, 5);
        assert_eq!(rows[0].temperature, Some(20.0));
    }

    #[tokio::test]
    async fn test_flushes_on_timer() {
        let store = Arc::new(MemoryStore::new());
        let (tx, rx) = mpsc::channel(100);
        tokio::spawn(run_batcher(rx, store.clone(), 1000, 10));

        let mut t = Telemetry::new(2, Utc::now());
        t.humidity = Some(45.0);
        tx.send(t).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.latest_telemetry(2).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_drops_batch_after_all_retries_fail() {
        let store = FlakyStore::new(usize::MAX);
        let mut buffer = pending_batch();

        let start = std::time::Instant::now();
        flush_batch(&store, &mut buffer).await;
        let elapsed = start.elapsed();

        // one initial insert plus every retry
        assert_eq!(store.inserts.load(Ordering::SeqCst), MAX_RETRIES as usize + 1);
        // 100 + 200 + 400 ms of backoff
        assert!(elapsed >= Duration::from_millis(700), "elapsed {:?}", elapsed);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_last_retry_can_succeed() {
        let store = FlakyStore::new(3);
        let mut buffer = pending_batch();

        flush_batch(&store, &mut buffer).await;

        assert_eq!(store.inserts.load(Ordering::SeqCst), 4);
        assert!(buffer.is_empty());
    }
}
