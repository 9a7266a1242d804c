use super::extract::{ApiJson, ApiPath, ApiQuery};
use super::{AppError, AppState};
use crate::errors::Error;
use crate::model::{ActionResponse, DeviceEventRequest, Event, Paged, Severity};
use crate::store::{query_limit, EventFilter};
use crate::validate::offset_bound;
use axum::{extract::State, http::StatusCode, Json};
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct EventQuery {
    device_id: Option<i64>,
    event_type: Option<String>,
    severity: Option<Severity>,
    acknowledged: Option<bool>,
    limit: Option<usize>,
    offset: Option<usize>,
}

pub async fn list_events(
    State(state): State<AppState>,
    ApiQuery(params): ApiQuery<EventQuery>,
) -> Result<Json<Paged<Event>>, AppError> {
    let limit = query_limit(params.limit);
    let offset = offset_bound(params.offset)?;
    let filter = EventFilter {
        device_id: params.device_id,
        event_type: params.event_type,
        severity: params.severity,
        acknowledged: params.acknowledged,
    };

    let (data, total) = state.store.list_events(&filter, limit, offset).await?;

    Ok(Json(Paged {
        data,
        total,
        limit,
        offset,
    }))
}

pub async fn acknowledge_event(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
) -> Result<Json<Event>, AppError> {
    let event = state
        .store
        .acknowledge_event(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Event with ID {} not found", id)))?;
    info!("Event {} acknowledged", id);
    Ok(Json(event))
}

pub async fn report_event(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<DeviceEventRequest>,
) -> Result<(StatusCode, Json<ActionResponse>), AppError> {
    let event = state.ingest.report_event(request).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ActionResponse::ok(format!("Event {} recorded", event.id))),
    ))
}
