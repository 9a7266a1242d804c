mod dashboard;
mod devices;
mod events;
mod extract;
mod telemetry;

use crate::errors::Error;
use crate::events::EventBus;
use crate::ingest::Ingest;
use crate::metrics;
use crate::store::Store;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tracing::error;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub ingest: Ingest,
    pub events: EventBus,
    pub offline_timeout: chrono::Duration,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/devices", get(devices::list_devices).post(devices::create_device))
        .route("/devices/in_stock", get(devices::in_stock))
        .route("/devices/deployed", get(devices::deployed))
        .route("/devices/maintenance", get(devices::in_maintenance))
        .route("/devices/telemetry", post(telemetry::ingest_telemetry))
        .route("/devices/events", post(events::report_event))
        .route(
            "/devices/:id",
            get(devices::get_device)
                .put(devices::update_device)
                .delete(devices::retire_device),
        )
        .route("/devices/:id/status", put(devices::set_status))
        .route("/devices/:id/deploy", put(devices::deploy))
        .route("/devices/:id/recall", put(devices::recall))
        .route("/devices/:id/maintenance", put(devices::maintenance))
        .route("/devices/:id/reserve", put(devices::reserve))
        .route("/devices/:id/type", get(devices::device_type))
        .route("/devices/:id/logs", get(devices::device_logs))
        .route("/devices/:id/telemetry/latest", get(telemetry::latest_telemetry))
        .route("/api/v1/telemetry", get(telemetry::get_telemetry))
        .route("/api/v1/telemetry/summary", get(telemetry::get_summary))
        .route("/api/v1/events", get(events::list_events))
        .route("/api/v1/events/:id/ack", put(events::acknowledge_event))
        .route("/api/v1/dashboard", get(dashboard::get_dashboard))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler() -> Result<String, AppError> {
    Ok(metrics::gather_metrics()?)
}

pub struct AppError(Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Validation(_) | Error::InvalidState(_) | Error::Conflict(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let detail = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("API error: {}", self.0);
            format!("Internal server error: {}", self.0)
        } else {
            self.0.to_string()
        };

        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
