use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    config::{AgvConfig, YardConfig},
    error::{AppError, AppResult},
};

/// A point in the yard, in metres.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance_to(&self, other: &Position) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    pub fn within(&self, yard: &YardConfig) -> bool {
        self.is_finite()
            && (0.0..=yard.width).contains(&self.x)
            && (0.0..=yard.height).contains(&self.y)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgvStatus {
    Idle,
    Moving,
    Charging,
    ExecutingTask,
    EmergencyStopped,
    Maintenance,
}

/// An automated guided vehicle and its mutable runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agv {
    pub id: String,
    pub name: String,
    pub position: Position,
    /// Always within [0, 100].
    pub battery_level: f64,
    pub status: AgvStatus,
    /// Back reference to the task this vehicle executes.
    pub current_task_id: Option<String>,
    /// Last status change or motion progress; drives stall detection.
    pub last_activity: DateTime<Utc>,
    /// Remaining waypoints of the current leg, nearest first.
    #[serde(default)]
    pub path: VecDeque<Position>,
}

impl Agv {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        position: Position,
        battery_level: f64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            position,
            battery_level: battery_level.clamp(0.0, 100.0),
            status: AgvStatus::Idle,
            current_task_id: None,
            last_activity: now,
            path: VecDeque::new(),
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity = now;
    }

    /// Clamps to [0, 100]; an idle vehicle that drops under the charging
    /// threshold goes to charge on its own.
    pub fn set_battery(&mut self, level: f64, charging_threshold: f64, now: DateTime<Utc>) {
        self.battery_level = if level.is_nan() { 0.0 } else { level.clamp(0.0, 100.0) };
        if self.status == AgvStatus::Idle && self.battery_level < charging_threshold {
            self.status = AgvStatus::Charging;
            self.touch(now);
        }
    }

    /// Ordinary status change. Entering or leaving `EmergencyStopped` is reserved
    /// to the emergency controller.
    pub fn set_status(&mut self, status: AgvStatus, now: DateTime<Utc>) -> AppResult<()> {
        if self.status == AgvStatus::EmergencyStopped {
            return Err(AppError::invalid_transition(format!(
                "{} is emergency stopped; only a reset may release it",
                self.id
            )));
        }
        if status == AgvStatus::EmergencyStopped {
            return Err(AppError::invalid_transition(format!(
                "{} may only be stopped through the emergency controller",
                self.id
            )));
        }
        if self.status != status {
            self.status = status;
            self.touch(now);
        }
        Ok(())
    }

    pub(crate) fn engage_emergency_stop(&mut self, now: DateTime<Utc>) {
        self.status = AgvStatus::EmergencyStopped;
        self.path.clear();
        self.touch(now);
    }

    pub(crate) fn clear_emergency_stop(&mut self, now: DateTime<Utc>) -> AppResult<()> {
        if self.status != AgvStatus::EmergencyStopped {
            return Err(AppError::invalid_transition(format!(
                "{} is {:?}, not emergency stopped",
                self.id, self.status
            )));
        }
        self.status = AgvStatus::Idle;
        self.touch(now);
        Ok(())
    }

    /// Moving under its own power, either on a task or a manual move.
    pub fn is_active(&self) -> bool {
        matches!(self.status, AgvStatus::Moving | AgvStatus::ExecutingTask)
    }
}

/// Ordered from least to most urgent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPriority {
    Low,
    #[serde(alias = "MEDIUM")]
    Normal,
    High,
    Urgent,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Waiting in the queue for a vehicle.
    Pending,
    /// A vehicle is driving to the pickup point.
    Assigned,
    /// Picked up; the vehicle is driving to the destination.
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

/// A transport job from `origin` to `destination`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub container_id: Option<String>,
    pub origin: Position,
    pub destination: Position,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    /// Set while assigned or in progress.
    pub assigned_agv_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Last route accepted for the vehicle executing this task.
    #[serde(default)]
    pub route: Option<Route>,
}

impl Task {
    pub fn is_active(&self) -> bool {
        matches!(self.status, TaskStatus::Assigned | TaskStatus::InProgress)
    }

    pub fn is_open(&self) -> bool {
        self.status == TaskStatus::Pending || self.is_active()
    }

    /// Where the executing vehicle is currently headed.
    pub fn leg_target(&self) -> Position {
        match self.status {
            TaskStatus::Assigned => self.origin,
            _ => self.destination,
        }
    }

    /// Straight-line length of pickup plus delivery from `from`.
    pub fn trip_distance_from(&self, from: &Position) -> f64 {
        from.distance_to(&self.origin) + self.origin.distance_to(&self.destination)
    }
}

/// An ordered list of waypoints with its estimated traversal cost.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub id: String,
    pub waypoints: Vec<Position>,
    pub total_distance: f64,
    pub estimated_minutes: f64,
    /// Battery percent needed to drive the route.
    pub energy_cost: f64,
    pub created_at: DateTime<Utc>,
}

impl Route {
    /// Build a route and derive its metrics from the waypoint chain.
    pub fn through(waypoints: Vec<Position>, agv: &AgvConfig, now: DateTime<Utc>) -> Self {
        let total_distance = waypoints
            .windows(2)
            .map(|pair| pair[0].distance_to(&pair[1]))
            .sum::<f64>();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            waypoints,
            total_distance,
            estimated_minutes: total_distance / agv.speed_m_per_s() / 60.0,
            energy_cost: agv.energy_for(total_distance),
            created_at: now,
        }
    }

    /// Checks that a suggested route is drivable and actually leads to `destination`.
    pub fn validate(&self, destination: &Position, yard: &YardConfig, epsilon: f64) -> Result<(), String> {
        let last = self.waypoints.last().ok_or("route has no waypoints")?;
        if let Some(bad) = self.waypoints.iter().find(|p| !p.within(yard)) {
            return Err(format!("waypoint ({}, {}) is outside the yard", bad.x, bad.y));
        }
        if last.distance_to(destination) > epsilon {
            return Err("route does not end at the destination".to_string());
        }
        if let Some(leg) = self
            .waypoints
            .windows(2)
            .map(|pair| pair[0].distance_to(&pair[1]))
            .find(|leg| *leg > yard.max_route_leg)
        {
            return Err(format!("leg of {leg:.1} m exceeds the maximum"));
        }
        if !(self.total_distance.is_finite() && self.total_distance >= 0.0)
            || !self.energy_cost.is_finite()
            || !self.estimated_minutes.is_finite()
        {
            return Err("route cost is not a finite non-negative number".to_string());
        }
        Ok(())
    }
}

/// Aggregates derived from the current AGV and task sets.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FleetMetrics {
    pub total_agvs: usize,
    pub idle_agvs: usize,
    pub moving_agvs: usize,
    pub executing_agvs: usize,
    pub charging_agvs: usize,
    pub emergency_stopped_agvs: usize,
    pub maintenance_agvs: usize,
    pub pending_tasks: usize,
    pub active_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub cancelled_tasks: usize,
    pub average_battery: f64,
    /// Share of vehicles moving or executing, in [0, 1].
    pub efficiency_ratio: f64,
}

impl FleetMetrics {
    pub fn compute<'a>(
        agvs: impl IntoIterator<Item = &'a Agv>,
        tasks: impl IntoIterator<Item = &'a Task>,
    ) -> Self {
        let mut metrics = FleetMetrics::default();
        let mut battery_sum = 0.0;
        for agv in agvs {
            metrics.total_agvs += 1;
            battery_sum += agv.battery_level;
            match agv.status {
                AgvStatus::Idle => metrics.idle_agvs += 1,
                AgvStatus::Moving => metrics.moving_agvs += 1,
                AgvStatus::ExecutingTask => metrics.executing_agvs += 1,
                AgvStatus::Charging => metrics.charging_agvs += 1,
                AgvStatus::EmergencyStopped => metrics.emergency_stopped_agvs += 1,
                AgvStatus::Maintenance => metrics.maintenance_agvs += 1,
            }
        }
        for task in tasks {
            match task.status {
                TaskStatus::Pending => metrics.pending_tasks += 1,
                TaskStatus::Assigned | TaskStatus::InProgress => metrics.active_tasks += 1,
                TaskStatus::Completed => metrics.completed_tasks += 1,
                TaskStatus::Failed => metrics.failed_tasks += 1,
                TaskStatus::Cancelled => metrics.cancelled_tasks += 1,
            }
        }
        if metrics.total_agvs > 0 {
            metrics.average_battery = battery_sum / metrics.total_agvs as f64;
            metrics.efficiency_ratio =
                (metrics.moving_agvs + metrics.executing_agvs) as f64 / metrics.total_agvs as f64;
        }
        metrics
    }
}

/// Immutable view of the fleet published at tick boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetSnapshot {
    pub taken_at: DateTime<Utc>,
    pub tick: u64,
    pub metrics: FleetMetrics,
    pub agvs: Vec<Agv>,
    pub tasks: Vec<Task>,
}

impl FleetSnapshot {
    pub fn agv(&self, id: &str) -> Option<&Agv> {
        self.agvs.iter().find(|agv| agv.id == id)
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == id)
    }
}
