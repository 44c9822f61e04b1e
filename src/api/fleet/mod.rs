use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use crate::{error::AppError, state::AppState};

#[derive(Debug, Deserialize)]
pub struct Limit {
    pub limit: Option<usize>,
}

pub async fn get_snapshot(State(app_state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(app_state.fleet.get_fleet_snapshot().as_ref().clone())
}

pub async fn get_metrics(State(app_state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(app_state.fleet.get_fleet_snapshot().metrics.clone())
}

pub async fn optimize_routes(State(app_state): State<Arc<AppState>>) -> Result<impl IntoResponse, AppError> {
    Ok(Json(app_state.fleet.request_route_optimization().await?))
}

pub async fn get_insights(State(app_state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(app_state.fleet.request_insights().await)
}

pub async fn list_alerts(
    State(app_state): State<Arc<AppState>>,
    Query(q): Query<Limit>,
) -> impl IntoResponse {
    Json(app_state.events.recent_alerts(q.limit.unwrap_or(50)))
}

pub async fn unacknowledged_alerts(State(app_state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(app_state.events.unacknowledged_alerts())
}

pub async fn acknowledge_alert(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    if !app_state.events.acknowledge(&id) {
        return Err(AppError::not_found(format!("alert {id}")));
    }
    Ok(Json(json!({ "alertId": id, "acknowledged": true })))
}

pub async fn list_events(
    State(app_state): State<Arc<AppState>>,
    Query(q): Query<Limit>,
) -> impl IntoResponse {
    Json(app_state.events.recent_events(q.limit.unwrap_or(100)))
}

pub async fn start_clock(State(app_state): State<Arc<AppState>>) -> impl IntoResponse {
    let started = app_state.clock.start();
    Json(json!({ "state": app_state.clock.state(), "changed": started }))
}

pub async fn stop_clock(State(app_state): State<Arc<AppState>>) -> impl IntoResponse {
    let stopped = app_state.clock.stop();
    Json(json!({ "state": app_state.clock.state(), "changed": stopped }))
}

pub async fn health_check(State(app_state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = app_state.fleet.get_fleet_snapshot();
    Json(json!({
        "status": "healthy",
        "agvs": snapshot.metrics.total_agvs,
        "clock": app_state.clock.state(),
        "timestamp": Utc::now()
    }))
}

pub async fn system_status(State(app_state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = app_state.fleet.get_fleet_snapshot();
    let settings = &app_state.config.settings;
    Json(json!({
        "startedAt": app_state.started_at,
        "uptimeSeconds": (Utc::now() - app_state.started_at).num_seconds(),
        "clock": {
            "state": app_state.clock.state(),
            "tick": snapshot.tick,
            "tickIntervalMs": settings.simulation.tick_interval.as_millis() as u64,
            "speedMultiplier": settings.simulation.speed_multiplier,
        },
        "advisor": {
            "enabled": settings.advisor.enabled && settings.advisor.url.is_some(),
            "timeoutMs": settings.advisor.timeout.as_millis() as u64,
        },
        "metrics": snapshot.metrics,
        "unacknowledgedAlerts": app_state.events.unacknowledged_alerts().len(),
        "storage": app_state.config.database_root_path,
    }))
}
