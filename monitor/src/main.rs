mod alerts;
mod batching;
mod config;
mod db;
mod errors;
mod events;
mod ingest;
mod lifecycle;
mod memory;
mod metrics;
mod model;
mod mqtt;
mod rest;
mod store;
mod validate;

use anyhow::Context;
use clap::Parser;
use config::{Config, StorageBackend};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "monitor=info,tower_http=warn";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    info!("Starting IoT Monitor");
    info!("HTTP server: {}", config.http_addr);
    if config.mqtt_enabled {
        info!("MQTT broker: {}:{}", config.mqtt_broker, config.mqtt_port);
    }

    metrics::init_metrics().context("failed to register metrics")?;

    let store: Arc<dyn store::Store> = match config.storage {
        StorageBackend::Postgres => {
            info!("Database: {}", config.database_host());
            let pg = db::PgStore::connect(&config.database_url, config.max_db_connections)
                .await
                .context("failed to connect to database")?;
            Arc::new(pg)
        }
        StorageBackend::Memory => {
            warn!("Using in-memory storage, data will not survive a restart");
            Arc::new(memory::MemoryStore::new())
        }
    };

    // Create bounded channel for telemetry data
    info!("Channel capacity: {}", config.channel_capacity);
    let (tx, rx) = mpsc::channel(config.channel_capacity);

    let events = events::EventBus::new(store.clone());
    let health = Arc::new(alerts::HealthTracker::new(config.thresholds()));
    let ingest = ingest::Ingest::new(store.clone(), events.clone(), health.clone(), tx);

    let mqtt_handle = if config.mqtt_enabled {
        let client_id = format!("monitor-{}", uuid::Uuid::new_v4());
        let (broker, port) = (config.mqtt_broker.clone(), config.mqtt_port);
        let (ingest, events) = (ingest.clone(), events.clone());
        tokio::spawn(async move {
            if let Err(e) = mqtt::run_mqtt(broker, port, client_id, ingest, events).await {
                error!("MQTT task failed: {}", e);
            }
        })
    } else {
        info!("MQTT ingestion disabled");
        tokio::spawn(std::future::pending::<()>())
    };

    let batcher_store = store.clone();
    let (batch_size, batch_timeout_ms) = (config.batch_size, config.batch_timeout_ms);
    let batcher_handle = tokio::spawn(async move {
        batching::run_batcher(rx, batcher_store, batch_size, batch_timeout_ms).await;
    });

    let watchdog_handle = tokio::spawn(alerts::run_watchdog(
        health,
        events.clone(),
        Duration::from_secs(config.watchdog_interval_secs.max(1)),
        config.offline_timeout(),
    ));

    let app = rest::create_router(rest::AppState {
        store,
        ingest,
        events,
        offline_timeout: config.offline_timeout(),
    });

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.http_addr))?;

    info!("HTTP server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    });

    tokio::select! {
        _ = mqtt_handle => {
            error!("MQTT task terminated");
        }
        _ = batcher_handle => {
            error!("Batcher task terminated");
        }
        _ = watchdog_handle => {
            error!("Watchdog task terminated");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
    Ok(())
}
