use std::sync::Arc;

use axum::{Router, routing::*};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;

pub mod agv;
pub mod fleet;
pub mod tasks;

pub fn router(shared_state: Arc<AppState>) -> Router {
    Router::new()
        // Vehicles
        .route("/agvs", get(agv::list_agvs).post(agv::provision_agv))
        .route("/agvs/{id}", get(agv::get_agv).delete(agv::decommission_agv))
        .route("/agvs/{id}/move", post(agv::move_agv))
        .route("/agvs/{id}/emergency-stop", post(agv::emergency_stop))
        .route("/agvs/{id}/reset", post(agv::reset_agv))
        .route("/agvs/{id}/maintenance", post(agv::set_maintenance))
        // Tasks
        .route("/tasks", get(tasks::list_tasks).post(tasks::submit_task))
        .route("/tasks/emergency", post(tasks::submit_emergency_task))
        .route("/tasks/assign", post(tasks::assign_now))
        .route("/tasks/{id}", get(tasks::get_task))
        .route("/tasks/{id}/cancel", post(tasks::cancel_task))
        // Fleet
        .route("/fleet/snapshot", get(fleet::get_snapshot))
        .route("/fleet/metrics", get(fleet::get_metrics))
        .route("/fleet/optimize", post(fleet::optimize_routes))
        .route("/fleet/insights", get(fleet::get_insights))
        .route("/alerts", get(fleet::list_alerts))
        .route("/alerts/unacknowledged", get(fleet::unacknowledged_alerts))
        .route("/alerts/{id}/acknowledge", post(fleet::acknowledge_alert))
        .route("/events", get(fleet::list_events))
        .route("/simulation/start", post(fleet::start_clock))
        .route("/simulation/stop", post(fleet::stop_clock))
        // Health check and stats
        .route("/health", get(fleet::health_check))
        .route("/status", get(fleet::system_status))
        .with_state(shared_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
