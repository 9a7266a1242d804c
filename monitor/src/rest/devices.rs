use super::extract::{ApiJson, ApiPath, ApiQuery};
use super::{AppError, AppState};
use crate::errors::Error;
use crate::lifecycle::Action;
use crate::model::{
    event_types, ActionResponse, Device, DeviceListResponse, DeviceLog, DevicePatch,
    DeviceStatus, DeviceType, NewDevice, NewEvent,
};
use crate::store::DeviceFilter;
use crate::validate::{page_bounds, validate_new_device, validate_patch};
use axum::{extract::State, http::StatusCode, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

/// Status listings are not paged.
const UNBOUNDED: usize = i64::MAX as usize;

#[derive(Debug, Deserialize)]
pub struct DeviceListQuery {
    status: Option<DeviceStatus>,
    #[serde(rename = "type")]
    device_type: Option<DeviceType>,
    page: Option<usize>,
    page_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    status: DeviceStatus,
    location: Option<String>,
    notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeployRequest {
    location: String,
    notes: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RecallRequest {
    location: Option<String>,
    notes: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct NotesRequest {
    notes: Option<String>,
}

pub async fn list_devices(
    State(state): State<AppState>,
    ApiQuery(params): ApiQuery<DeviceListQuery>,
) -> Result<Json<DeviceListResponse>, AppError> {
    let (limit, offset) = page_bounds(params.page, params.page_size)?;
    let filter = DeviceFilter {
        status: params.status,
        device_type: params.device_type,
    };

    let (devices, total) = state.store.list_devices(filter, limit, offset).await?;

    Ok(Json(DeviceListResponse {
        devices,
        total,
        page: params.page.unwrap_or(1),
        page_size: limit,
    }))
}

async fn list_by_status(
    state: &AppState,
    status: DeviceStatus,
) -> Result<Json<Vec<Device>>, AppError> {
    let (devices, _) = state
        .store
        .list_devices(DeviceFilter::status(status), UNBOUNDED, 0)
        .await?;
    Ok(Json(devices))
}

pub async fn in_stock(State(state): State<AppState>) -> Result<Json<Vec<Device>>, AppError> {
    list_by_status(&state, DeviceStatus::InStock).await
}

pub async fn deployed(State(state): State<AppState>) -> Result<Json<Vec<Device>>, AppError> {
    list_by_status(&state, DeviceStatus::Deployed).await
}

pub async fn in_maintenance(State(state): State<AppState>) -> Result<Json<Vec<Device>>, AppError> {
    list_by_status(&state, DeviceStatus::Maintenance).await
}

pub async fn create_device(
    State(state): State<AppState>,
    ApiJson(new): ApiJson<NewDevice>,
) -> Result<(StatusCode, Json<Device>), AppError> {
    validate_new_device(&new)?;
    let device = state.store.create_device(new).await?;
    info!("Registered device {} ({})", device.id, device.serial_number);
    Ok((StatusCode::CREATED, Json(device)))
}

pub async fn get_device(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
) -> Result<Json<Device>, AppError> {
    let device = state
        .store
        .get_device(id)
        .await?
        .ok_or_else(|| Error::device_not_found(id))?;
    Ok(Json(device))
}

pub async fn update_device(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
    ApiJson(patch): ApiJson<DevicePatch>,
) -> Result<Json<Device>, AppError> {
    validate_patch(&patch)?;
    let device = state
        .store
        .update_device(id, patch)
        .await?
        .ok_or_else(|| Error::device_not_found(id))?;
    Ok(Json(device))
}

/// Applies a lifecycle action and stops health tracking for devices that
/// are no longer deployed.
async fn run_action(
    state: &AppState,
    id: i64,
    action: Action,
    notes: Option<String>,
) -> Result<Device, AppError> {
    let (device, log) = state.store.apply_action(id, action, notes).await?;
    if device.status != DeviceStatus::Deployed {
        state.ingest.health().forget(id);
    }
    info!("Device {} {} (now {})", id, log.action, device.status);
    Ok(device)
}

pub async fn retire_device(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
) -> Result<Json<ActionResponse>, AppError> {
    let device = run_action(&state, id, Action::Retire, None).await?;
    Ok(Json(ActionResponse::with_device("Device retired successfully", device)))
}

pub async fn set_status(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
    ApiJson(request): ApiJson<StatusRequest>,
) -> Result<Json<Device>, AppError> {
    let action = Action::SetStatus {
        status: request.status,
        location: request.location,
    };
    Ok(Json(run_action(&state, id, action, request.notes).await?))
}

pub async fn deploy(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
    ApiJson(request): ApiJson<DeployRequest>,
) -> Result<Json<ActionResponse>, AppError> {
    let action = Action::Deploy {
        location: request.location,
    };
    let device = run_action(&state, id, action, request.notes).await?;
    Ok(Json(ActionResponse::with_device("Device deployed successfully", device)))
}

pub async fn recall(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
    body: Option<Json<RecallRequest>>,
) -> Result<Json<ActionResponse>, AppError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let action = Action::Recall {
        location: request.location,
    };
    let device = run_action(&state, id, action, request.notes).await?;
    Ok(Json(ActionResponse::with_device("Device recalled successfully", device)))
}

pub async fn maintenance(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
    body: Option<Json<NotesRequest>>,
) -> Result<Json<ActionResponse>, AppError> {
    let notes = body.and_then(|Json(r)| r.notes);
    let device = run_action(&state, id, Action::Maintenance, notes).await?;
    Ok(Json(ActionResponse::with_device(
        "Device sent to maintenance successfully",
        device,
    )))
}

pub async fn reserve(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
    body: Option<Json<NotesRequest>>,
) -> Result<Json<ActionResponse>, AppError> {
    let notes = body.and_then(|Json(r)| r.notes);
    let details = json!({ "notes": notes.clone() });
    let device = run_action(&state, id, Action::Reserve, notes).await?;

    let event = NewEvent::new(id, event_types::DEVICE_RESERVED, Some(details));
    if let Err(e) = state.events.emit(event).await {
        warn!("Failed to record reservation event for device {}: {}", id, e);
    }

    Ok(Json(ActionResponse::with_device("Device reserved successfully", device)))
}

pub async fn device_type(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
) -> Result<Json<Value>, AppError> {
    let device = state
        .store
        .get_device(id)
        .await?
        .ok_or_else(|| Error::device_not_found(id))?;
    Ok(Json(json!({ "device_id": device.id, "type": device.device_type })))
}

pub async fn device_logs(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
) -> Result<Json<Vec<DeviceLog>>, AppError> {
    if state.store.get_device(id).await?.is_none() {
        return Err(Error::device_not_found(id).into());
    }
    Ok(Json(state.store.device_logs(id).await?))
}
