use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use log::info;
use serde::Deserialize;
use serde_json::json;

use crate::{
    error::AppError,
    models::TaskStatus,
    schema::{EmergencyTaskRequest, TaskSpec},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
}

pub async fn list_tasks(
    State(app_state): State<Arc<AppState>>,
    Query(filter): Query<TaskFilter>,
) -> impl IntoResponse {
    let snapshot = app_state.fleet.get_fleet_snapshot();
    let tasks: Vec<_> = snapshot
        .tasks
        .iter()
        .filter(|task| filter.status.is_none_or(|status| task.status == status))
        .cloned()
        .collect();
    Json(tasks)
}

pub async fn get_task(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(app_state.fleet.task(&id)?))
}

pub async fn submit_task(
    State(app_state): State<Arc<AppState>>,
    Json(req): Json<TaskSpec>,
) -> Result<impl IntoResponse, AppError> {
    let task = app_state.fleet.enqueue_task(req).await?;
    info!("New task {} ({:?})", task.id, task.priority);
    Ok((StatusCode::CREATED, Json(task)))
}

pub async fn submit_emergency_task(
    State(app_state): State<Arc<AppState>>,
    Json(req): Json<EmergencyTaskRequest>,
) -> Result<impl IntoResponse, AppError> {
    let (task, assignment) = app_state.fleet.enqueue_emergency_task(req).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "task": task,
            "assignment": assignment,
        })),
    ))
}

pub async fn cancel_task(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(app_state.fleet.cancel_task(&id).await?))
}

pub async fn assign_now(State(app_state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(app_state.fleet.assign_now().await)
}
