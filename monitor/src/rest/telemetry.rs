use super::extract::{ApiJson, ApiPath, ApiQuery};
use super::{AppError, AppState};
use crate::errors::Error;
use crate::model::{ActionResponse, Paged, Telemetry, TelemetrySummary};
use crate::store::{query_limit, TelemetryFilter};
use crate::validate::offset_bound;
use axum::{extract::State, http::StatusCode, Json};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Deserialize)]
pub struct TelemetryQuery {
    device_id: Option<i64>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct SummaryQuery {
    device_id: i64,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

pub async fn get_telemetry(
    State(state): State<AppState>,
    ApiQuery(params): ApiQuery<TelemetryQuery>,
) -> Result<Json<Paged<Telemetry>>, AppError> {
    let limit = query_limit(params.limit);
    let offset = offset_bound(params.offset)?;
    let filter = TelemetryFilter {
        device_id: params.device_id,
        start: params.start,
        end: params.end,
    };

    let (data, total) = state.store.query_telemetry(&filter, limit, offset).await?;

    Ok(Json(Paged {
        data,
        total,
        limit,
        offset,
    }))
}

pub async fn get_summary(
    State(state): State<AppState>,
    ApiQuery(params): ApiQuery<SummaryQuery>,
) -> Result<Json<TelemetrySummary>, AppError> {
    if state.store.get_device(params.device_id).await?.is_none() {
        return Err(Error::device_not_found(params.device_id).into());
    }

    let summary = state
        .store
        .telemetry_summary(params.device_id, params.start, params.end)
        .await?;
    Ok(Json(summary))
}

pub async fn latest_telemetry(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
) -> Result<Json<Telemetry>, AppError> {
    let latest = state
        .store
        .latest_telemetry(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("No telemetry for device {}", id)))?;
    Ok(Json(latest))
}

pub async fn ingest_telemetry(
    State(state): State<AppState>,
    ApiJson(telemetry): ApiJson<Telemetry>,
) -> Result<(StatusCode, Json<ActionResponse>), AppError> {
    let device_id = telemetry.device_id;
    state.ingest.accept(telemetry).await?;
    debug!("Accepted telemetry for device {} over HTTP", device_id);
    Ok((
        StatusCode::ACCEPTED,
        Json(ActionResponse::ok("Telemetry accepted")),
    ))
}
