use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use log::info;
use serde_json::json;

use crate::{
    error::AppError,
    schema::{MaintenanceRequest, MoveAgvRequest, ProvisionAgvRequest},
    state::AppState,
};

pub async fn list_agvs(State(app_state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(app_state.fleet.get_fleet_snapshot().agvs.clone())
}

pub async fn get_agv(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(app_state.fleet.agv(&id)?))
}

pub async fn provision_agv(
    State(app_state): State<Arc<AppState>>,
    Json(req): Json<ProvisionAgvRequest>,
) -> Result<impl IntoResponse, AppError> {
    let agv = app_state.fleet.provision_agv(req).await?;
    info!("Provisioned {} ({})", agv.id, agv.name);
    Ok((StatusCode::CREATED, Json(agv)))
}

pub async fn decommission_agv(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    app_state.fleet.decommission_agv(&id).await?;
    Ok(Json(json!({
        "agvId": id,
        "message": "Vehicle decommissioned"
    })))
}

pub async fn move_agv(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<MoveAgvRequest>,
) -> Result<impl IntoResponse, AppError> {
    let agv = app_state.fleet.move_agv(&id, req.target).await?;
    Ok(Json(agv))
}

pub async fn emergency_stop(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let released = app_state.fleet.emergency_stop(&id).await?;
    Ok(Json(json!({
        "agvId": id,
        "status": "EMERGENCY_STOPPED",
        "releasedTaskId": released
    })))
}

pub async fn reset_agv(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(app_state.fleet.reset_agv(&id).await?))
}

pub async fn set_maintenance(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<MaintenanceRequest>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(app_state.fleet.set_maintenance(&id, req.enabled).await?))
}
