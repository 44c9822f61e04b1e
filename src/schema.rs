//! src/schema.rs
//!
//! Request and response bodies of the fleet command surface.
//! The same structs are used by the HTTP handlers and by `FleetHandle` callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Position, Route, TaskPriority};

//=============================================================================
//  Task Commands
//=============================================================================

/// Body of a transport task submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    /// Caller-chosen id; generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub origin: Position,
    pub destination: Position,
    #[serde(default = "default_priority")]
    pub priority: TaskPriority,
    /// Defaults to creation time plus the configured task timeout.
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub container_id: Option<String>,
}

fn default_priority() -> TaskPriority {
    TaskPriority::Normal
}

impl TaskSpec {
    pub fn new(origin: Position, destination: Position, priority: TaskPriority) -> Self {
        Self {
            id: None,
            origin,
            destination,
            priority,
            deadline: None,
            description: None,
            container_id: None,
        }
    }
}

/// An URGENT task that is assigned right away if any vehicle can take it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyTaskRequest {
    pub origin: Position,
    pub destination: Position,
    pub description: String,
    #[serde(default)]
    pub container_id: Option<String>,
}

//=============================================================================
//  Vehicle Commands
//=============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveAgvRequest {
    pub target: Position,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionAgvRequest {
    /// Generated as `AGV-<ulid>` when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub position: Position,
    #[serde(default = "full_battery")]
    pub battery_level: f64,
}

fn full_battery() -> f64 {
    100.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceRequest {
    /// true puts the vehicle into maintenance, false returns it to service.
    pub enabled: bool,
}

//=============================================================================
//  Scheduling Results
//=============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentRecord {
    pub task_id: String,
    pub agv_id: String,
    /// Straight-line metres from the vehicle to the pickup point.
    pub distance_to_origin: f64,
}

/// Outcome of one scheduling pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentReport {
    pub assigned: Vec<AssignmentRecord>,
    pub remaining_pending: usize,
    pub capacity_reached: bool,
}

/// Summary of one simulation tick.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
    pub tick: u64,
    pub distance_travelled: f64,
    pub started: Vec<String>,
    pub completed: Vec<String>,
    pub interrupted: Vec<String>,
    pub assignment: AssignmentReport,
    pub expired: Vec<String>,
    pub alerts_raised: usize,
}

//=============================================================================
//  Advisor Results
//=============================================================================

/// Where a route or pairing came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RouteSource {
    Advisor,
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSuggestion {
    pub agv_id: String,
    pub task_id: String,
    pub route: Route,
    pub source: RouteSource,
    /// Whether the route was installed on the vehicle.
    pub applied: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationReport {
    pub requested_at: DateTime<Utc>,
    pub routes: Vec<RouteSuggestion>,
    /// Pending tasks paired by the assignment advisor in this call.
    pub assignments: Vec<AssignmentRecord>,
    pub assignment_source: RouteSource,
    /// Grid cells crossed by several suggested routes, busiest first.
    pub congestion_zones: Vec<CongestionZone>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CongestionLevel {
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CongestionZone {
    pub zone: String,
    /// Lower-left corner of the grid cell.
    pub coordinates: Position,
    pub waypoint_count: usize,
    pub level: CongestionLevel,
    pub estimated_delay_minutes: f64,
    pub recommendation: String,
}

//=============================================================================
//  Insights
//=============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InsightLevel {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Insight {
    pub level: InsightLevel,
    pub title: String,
    pub detail: String,
    pub recommendation: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MaintenanceUrgency {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenancePrediction {
    pub agv_id: String,
    pub needs_maintenance: bool,
    pub urgency: MaintenanceUrgency,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsightsReport {
    pub generated_at: DateTime<Utc>,
    pub insights: Vec<Insight>,
    pub maintenance: Vec<MaintenancePrediction>,
}
