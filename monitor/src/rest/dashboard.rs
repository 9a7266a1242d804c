use super::{AppError, AppState};
use crate::model::DashboardSummary;
use crate::store::EventFilter;
use axum::{extract::State, Json};
use chrono::Utc;

const RECENT_EVENTS: usize = 10;

pub async fn get_dashboard(
    State(state): State<AppState>,
) -> Result<Json<DashboardSummary>, AppError> {
    let counts = state.store.device_counts().await?;
    let mut summary = DashboardSummary::from_counts(&counts);

    let (online, offline) = state
        .ingest
        .health()
        .connectivity(Utc::now(), state.offline_timeout);
    summary.online_devices = online;
    summary.offline_devices = offline;

    let unacknowledged = EventFilter {
        acknowledged: Some(false),
        ..Default::default()
    };
    let (_, open) = state.store.list_events(&unacknowledged, 1, 0).await?;
    summary.unacknowledged_events = open;

    let (recent, _) = state
        .store
        .list_events(&EventFilter::default(), RECENT_EVENTS, 0)
        .await?;
    summary.recent_events = recent;

    Ok(Json(summary))
}
