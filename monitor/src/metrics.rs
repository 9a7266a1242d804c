use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref TELEMETRY_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_telemetry_total",
        "Total telemetry readings received over MQTT and HTTP"
    ))
    .expect("valid metric opts");
    pub static ref VALID_TELEMETRY_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_valid_telemetry_total",
        "Total telemetry readings accepted for storage"
    ))
    .expect("valid metric opts");
    pub static ref INVALID_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_invalid_messages_total",
        "Total MQTT messages rejected"
    ))
    .expect("valid metric opts");
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_db_failures_total",
        "Total database insert failures"
    ))
    .expect("valid metric opts");
    pub static ref INGEST_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "monitor_ingest_latency_seconds",
            "Time taken to ingest batch into DB"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .expect("valid metric opts");
    pub static ref BATCH_SIZE: Gauge = Gauge::with_opts(Opts::new(
        "monitor_batch_size",
        "Current batch size being processed"
    ))
    .expect("valid metric opts");
    pub static ref CHANNEL_FULL_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_channel_full_total",
        "Total number of times channel was full (backpressure events)"
    ))
    .expect("valid metric opts");
    pub static ref EVENTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("monitor_events_total", "Total device events recorded"),
        &["severity"]
    )
    .expect("valid metric opts");
    pub static ref DEVICES_ONLINE: Gauge = Gauge::with_opts(Opts::new(
        "monitor_devices_online",
        "Deployed devices that reported within the offline timeout"
    ))
    .expect("valid metric opts");
    pub static ref DEVICES_OFFLINE: Gauge = Gauge::with_opts(Opts::new(
        "monitor_devices_offline",
        "Deployed devices silent for longer than the offline timeout"
    ))
    .expect("valid metric opts");
}

pub fn init_metrics() -> Result<(), prometheus::Error> {
    REGISTRY.register(Box::new(TELEMETRY_TOTAL.clone()))?;
    REGISTRY.register(Box::new(VALID_TELEMETRY_TOTAL.clone()))?;
    REGISTRY.register(Box::new(INVALID_MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DB_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(INGEST_LATENCY_SECONDS.clone()))?;
    REGISTRY.register(Box::new(BATCH_SIZE.clone()))?;
    REGISTRY.register(Box::new(CHANNEL_FULL_TOTAL.clone()))?;
    REGISTRY.register(Box::new(EVENTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DEVICES_ONLINE.clone()))?;
    REGISTRY.register(Box::new(DEVICES_OFFLINE.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
