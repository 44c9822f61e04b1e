use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use log::{debug, error, info, warn};
use serde_json::json;

use crate::{
    advisor::Pairing,
    config::{AgvConfig, FleetSettings},
    db::FleetStore,
    error::{AppError, AppResult},
    fleet::{
        emergency::{AlertController, EmergencyLatch, engage_stop},
        motion,
        scheduler::TaskScheduler,
    },
    models::{Agv, AgvStatus, FleetMetrics, FleetSnapshot, Position, Route, Task, TaskPriority, TaskStatus},
    notify::{EventKind, Notifier},
    schema::{
        AssignmentRecord, AssignmentReport, EmergencyTaskRequest, ProvisionAgvRequest, TaskSpec, TickReport,
    },
    utils::prefixed_uid,
};

/// Waypoint legs a vehicle may finish within a single tick.
const MAX_LEGS_PER_TICK: usize = 4;

/// A leg the advisor may re-plan, captured from the engine state.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub agv_id: String,
    pub task_id: String,
    /// Task status the leg belongs to; a route is stale once this changes.
    pub leg: TaskStatus,
    pub from: Position,
    pub target: Position,
    pub obstacles: Vec<Position>,
}

/// The fleet aggregate: vehicles, the scheduler and the alert state.
///
/// All mutation goes through `&mut self`, so whoever owns the engine
/// serializes ticks and commands. Time is passed in explicitly.
pub struct FleetEngine {
    settings: FleetSettings,
    agvs: IndexMap<String, Agv>,
    scheduler: TaskScheduler,
    alerts: AlertController,
    latch: EmergencyLatch,
    notifier: Arc<dyn Notifier>,
    store: Arc<dyn FleetStore>,
    dirty_agvs: HashSet<String>,
    removed_agvs: Vec<String>,
    tick: u64,
    persistence_degraded: bool,
}

impl FleetEngine {
    pub fn new(
        settings: FleetSettings,
        store: Arc<dyn FleetStore>,
        notifier: Arc<dyn Notifier>,
        latch: EmergencyLatch,
    ) -> Self {
        Self {
            scheduler: TaskScheduler::new(settings.clone()),
            alerts: AlertController::new(settings.alerts.clone()),
            settings,
            agvs: IndexMap::new(),
            latch,
            notifier,
            store,
            dirty_agvs: HashSet::new(),
            removed_agvs: Vec::new(),
            tick: 0,
            persistence_degraded: false,
        }
    }

    /// Build the engine from whatever the store holds. Unreadable stores
    /// start empty; dangling vehicle/task references are repaired.
    pub fn load(
        settings: FleetSettings,
        store: Arc<dyn FleetStore>,
        notifier: Arc<dyn Notifier>,
        latch: EmergencyLatch,
    ) -> Self {
        let mut engine = Self::new(settings, store.clone(), notifier, latch);

        match store.load_agvs() {
            Ok(agvs) => {
                for agv in agvs {
                    if agv.status == AgvStatus::EmergencyStopped {
                        engine.latch.engage(&agv.id);
                    }
                    engine.agvs.insert(agv.id.clone(), agv);
                }
            }
            Err(e) => warn!("Could not load vehicles, starting empty: {}", e),
        }
        match store.load_tasks() {
            Ok(tasks) => engine.scheduler.restore(tasks),
            Err(e) => warn!("Could not load tasks, starting empty: {}", e),
        }

        engine.repair_references();
        info!(
            "Fleet loaded: {} vehicles, {} tasks",
            engine.agvs.len(),
            engine.scheduler.tasks().count()
        );
        engine
    }

    fn repair_references(&mut self) {
        for agv in self.agvs.values_mut() {
            let Some(task_id) = agv.current_task_id.clone() else {
                continue;
            };
            let holds = self
                .scheduler
                .get(&task_id)
                .is_some_and(|t| t.is_active() && t.assigned_agv_id.as_deref() == Some(agv.id.as_str()));
            if !holds {
                warn!("Clearing dangling task {} from {}", task_id, agv.id);
                agv.current_task_id = None;
                agv.path.clear();
                if agv.status == AgvStatus::ExecutingTask {
                    agv.status = AgvStatus::Idle;
                }
                self.dirty_agvs.insert(agv.id.clone());
            }
        }

        let orphans: Vec<String> = self
            .scheduler
            .tasks()
            .filter(|t| t.is_active())
            .filter(|t| {
                t.assigned_agv_id
                    .as_deref()
                    .and_then(|id| self.agvs.get(id))
                    .is_none_or(|agv| agv.current_task_id.as_deref() != Some(t.id.as_str()))
            })
            .map(|t| t.id.clone())
            .collect();
        for task_id in orphans {
            warn!("Returning orphaned task {} to the queue", task_id);
            if let Some(task) = self.scheduler.task_mut(&task_id) {
                task.status = TaskStatus::Pending;
                task.assigned_agv_id = None;
                task.started_at = None;
                task.route = None;
            }
        }
    }

    pub fn settings(&self) -> &FleetSettings {
        &self.settings
    }

    pub fn latch(&self) -> &EmergencyLatch {
        &self.latch
    }

    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    pub fn agv(&self, id: &str) -> Option<&Agv> {
        self.agvs.get(id)
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.scheduler.get(id)
    }

    pub fn metrics(&self) -> FleetMetrics {
        FleetMetrics::compute(self.agvs.values(), self.scheduler.tasks())
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> FleetSnapshot {
        FleetSnapshot {
            taken_at: now,
            tick: self.tick,
            metrics: self.metrics(),
            agvs: self.agvs.values().cloned().collect(),
            tasks: self.scheduler.tasks().cloned().collect(),
        }
    }

    pub fn check_invariants(&self) -> AppResult<()> {
        self.scheduler
            .check_consistency(&self.agvs)
            .map_err(AppError::invariant)
    }

    fn dump_state(&self, reason: &str) {
        let dump = serde_json::to_string(&self.snapshot(Utc::now())).unwrap_or_default();
        error!("Invariant violated: {}. State dump: {}", reason, dump);
    }

    fn guard_invariants(&self) -> AppResult<()> {
        if let Err(e) = self.check_invariants() {
            self.dump_state(&e.to_string());
            return Err(e);
        }
        Ok(())
    }

    //=========================================================================
    //  Simulation tick
    //=========================================================================

    /// Advance the fleet by `tick_seconds` of simulated time: motion, then
    /// assignment, then expiry, then alert inspection.
    pub fn tick(&mut self, now: DateTime<Utc>, tick_seconds: f64) -> AppResult<TickReport> {
        self.guard_invariants()?;

        let mut report = TickReport {
            tick: self.tick + 1,
            ..Default::default()
        };

        self.motion_phase(now, tick_seconds, &mut report);

        report.assignment = self.scheduler.assign_pending(&mut self.agvs, &self.latch, now);
        for record in &report.assignment.assigned {
            self.dirty_agvs.insert(record.agv_id.clone());
            self.notifier.emit(
                EventKind::TaskAssigned,
                json!({
                    "taskId": record.task_id,
                    "agvId": record.agv_id,
                    "distanceToOrigin": record.distance_to_origin,
                }),
            );
        }

        for (task_id, agv_id) in self.scheduler.expire_overdue(&mut self.agvs, now) {
            if let Some(agv_id) = &agv_id {
                self.dirty_agvs.insert(agv_id.clone());
            }
            self.notifier.emit(
                EventKind::TaskFailed,
                json!({ "taskId": task_id, "agvId": agv_id, "reason": "deadline exceeded" }),
            );
            report.expired.push(task_id);
        }

        report.alerts_raised = self.alerts.inspect(
            self.agvs.values(),
            self.scheduler.tasks(),
            self.notifier.as_ref(),
            now,
        );

        self.guard_invariants()?;
        self.tick += 1;
        self.flush();

        debug!(
            "Tick {}: {:.1} m travelled, {} assigned, {} completed, {} expired",
            report.tick,
            report.distance_travelled,
            report.assignment.assigned.len(),
            report.completed.len(),
            report.expired.len()
        );
        Ok(report)
    }

    fn motion_phase(&mut self, now: DateTime<Utc>, tick_seconds: f64, report: &mut TickReport) {
        let cfg = self.settings.agv.clone();
        let budget = motion::travel_budget(tick_seconds, &cfg);

        for agv in self.agvs.values_mut() {
            if self.latch.is_engaged(&agv.id) {
                continue;
            }
            match agv.status {
                AgvStatus::Charging => {
                    let level = motion::charge(agv.battery_level, tick_seconds, &cfg);
                    agv.set_battery(level, cfg.charging_threshold, now);
                    if agv.battery_level >= cfg.charge_complete_level {
                        if let Err(e) = agv.set_status(AgvStatus::Idle, now) {
                            warn!("{}", e);
                        }
                        info!("{} finished charging at {:.1}%", agv.id, agv.battery_level);
                    }
                    self.dirty_agvs.insert(agv.id.clone());
                }
                AgvStatus::Moving | AgvStatus::ExecutingTask => {
                    advance_vehicle(agv, &mut self.scheduler, self.notifier.as_ref(), &cfg, budget, now, report);
                    self.dirty_agvs.insert(agv.id.clone());
                }
                AgvStatus::Idle if agv.battery_level < cfg.charging_threshold => {
                    agv.set_battery(agv.battery_level, cfg.charging_threshold, now);
                    self.dirty_agvs.insert(agv.id.clone());
                }
                _ => {}
            }
        }
    }

    //=========================================================================
    //  Commands
    //=========================================================================

    pub fn enqueue_task(&mut self, spec: TaskSpec, now: DateTime<Utc>) -> AppResult<Task> {
        let task = self.scheduler.create_task(spec, now);
        let id = self.scheduler.enqueue(task, now)?;
        let task = self.require_task(&id)?.clone();
        if let Err(e) = self.store.append_task(&task) {
            self.persistence_failed("append task", &e);
        }
        self.notifier.emit(
            EventKind::TaskEnqueued,
            json!({ "taskId": task.id, "priority": task.priority, "deadline": task.deadline }),
        );
        Ok(task)
    }

    /// URGENT task with an immediate assignment attempt.
    pub fn enqueue_emergency_task(
        &mut self,
        request: EmergencyTaskRequest,
        now: DateTime<Utc>,
    ) -> AppResult<(Task, Option<AssignmentRecord>)> {
        let spec = TaskSpec {
            id: Some(prefixed_uid("EMG")),
            origin: request.origin,
            destination: request.destination,
            priority: TaskPriority::Urgent,
            deadline: None,
            description: Some(request.description),
            container_id: request.container_id,
        };
        let task = self.enqueue_task(spec, now)?;

        let assignment = match self.scheduler.assign_best(&task.id, &mut self.agvs, &self.latch, now) {
            Ok(record) => record,
            Err(AppError::AssignmentCapacityExceeded { active, cap }) => {
                warn!("Emergency task {} queued: {} of {} tasks active", task.id, active, cap);
                None
            }
            Err(e) => return Err(e),
        };
        if let Some(record) = &assignment {
            self.dirty_agvs.insert(record.agv_id.clone());
        }

        self.notifier.emit(
            EventKind::EmergencyTaskCreated,
            json!({
                "taskId": task.id,
                "description": task.description,
                "assignedAgvId": assignment.as_ref().map(|r| r.agv_id.clone()),
            }),
        );
        let task = self.require_task(&task.id)?.clone();
        self.flush();
        Ok((task, assignment))
    }

    /// Run an assignment pass outside the clock.
    pub fn assign_now(&mut self, now: DateTime<Utc>) -> AssignmentReport {
        let report = self.scheduler.assign_pending(&mut self.agvs, &self.latch, now);
        for record in &report.assigned {
            self.dirty_agvs.insert(record.agv_id.clone());
            self.notifier.emit(
                EventKind::TaskAssigned,
                json!({ "taskId": record.task_id, "agvId": record.agv_id }),
            );
        }
        self.flush();
        report
    }

    pub fn cancel_task(&mut self, task_id: &str, now: DateTime<Utc>) -> AppResult<Task> {
        let agv_id = self.require_task(task_id)?.assigned_agv_id.clone();
        self.scheduler.cancel(task_id, &mut self.agvs, now)?;
        if let Some(agv_id) = &agv_id {
            self.dirty_agvs.insert(agv_id.clone());
        }
        self.notifier
            .emit(EventKind::TaskCancelled, json!({ "taskId": task_id, "agvId": agv_id }));
        let task = self.require_task(task_id)?.clone();
        self.flush();
        Ok(task)
    }

    /// Send an idle vehicle to `target`. It must be able to get there and
    /// still keep its battery reserve.
    pub fn move_agv(&mut self, agv_id: &str, target: Position, now: DateTime<Utc>) -> AppResult<Agv> {
        if !target.within(&self.settings.yard) {
            return Err(AppError::validation(format!(
                "target ({}, {}) is outside the yard",
                target.x, target.y
            )));
        }
        let cfg = &self.settings.agv;
        let latched = self.latch.is_engaged(agv_id);
        let agv = self
            .agvs
            .get_mut(agv_id)
            .ok_or_else(|| AppError::not_found(format!("vehicle {agv_id}")))?;
        if agv.status != AgvStatus::Idle || latched {
            return Err(AppError::invalid_transition(format!(
                "{} is {:?}; only idle vehicles can be moved",
                agv.id, agv.status
            )));
        }
        let needed = cfg.energy_for(agv.position.distance_to(&target));
        if agv.battery_level - needed < cfg.min_battery_level {
            return Err(AppError::validation(format!(
                "{} needs {:.1}% to reach the target but only has {:.1}%",
                agv.id, needed, agv.battery_level
            )));
        }

        agv.set_status(AgvStatus::Moving, now)?;
        agv.path.clear();
        agv.path.push_back(target);
        let moved = agv.clone();

        self.dirty_agvs.insert(moved.id.clone());
        self.notifier.emit(
            EventKind::AgvMoveCommanded,
            json!({ "agvId": moved.id, "from": moved.position, "to": target }),
        );
        self.flush();
        Ok(moved)
    }

    /// Stop a vehicle where it stands. Its task goes back to the queue.
    /// Returns the released task, if any.
    pub fn emergency_stop(&mut self, agv_id: &str, now: DateTime<Utc>) -> AppResult<Option<String>> {
        let agv = self
            .agvs
            .get_mut(agv_id)
            .ok_or_else(|| AppError::not_found(format!("vehicle {agv_id}")))?;
        let released = if agv.status == AgvStatus::EmergencyStopped {
            None
        } else {
            self.scheduler.detach(agv, now)
        };
        engage_stop(agv, &self.latch, self.notifier.as_ref(), released.as_deref(), now);
        self.dirty_agvs.insert(agv_id.to_string());
        self.flush();
        Ok(released)
    }

    pub fn reset_agv(&mut self, agv_id: &str, now: DateTime<Utc>) -> AppResult<Agv> {
        let cfg = &self.settings.agv;
        let agv = self
            .agvs
            .get_mut(agv_id)
            .ok_or_else(|| AppError::not_found(format!("vehicle {agv_id}")))?;
        agv.clear_emergency_stop(now)?;
        self.latch.release(agv_id);
        agv.set_battery(agv.battery_level, cfg.charging_threshold, now);
        let agv = agv.clone();

        info!("Emergency stop released on {}", agv_id);
        self.dirty_agvs.insert(agv.id.clone());
        self.notifier
            .emit(EventKind::EmergencyReset, json!({ "agvId": agv.id, "status": agv.status }));
        self.flush();
        Ok(agv)
    }

    pub fn provision_agv(&mut self, request: ProvisionAgvRequest, now: DateTime<Utc>) -> AppResult<Agv> {
        if self.agvs.len() >= self.settings.fleet.max_agvs {
            return Err(AppError::conflict(format!(
                "fleet is at its limit of {} vehicles",
                self.settings.fleet.max_agvs
            )));
        }
        if !request.position.within(&self.settings.yard) {
            return Err(AppError::validation("position is outside the yard"));
        }
        if !request.battery_level.is_finite() {
            return Err(AppError::validation("battery level must be a number"));
        }
        let id = request.id.unwrap_or_else(|| prefixed_uid("AGV"));
        if self.agvs.contains_key(&id) {
            return Err(AppError::conflict(format!("vehicle {id} already exists")));
        }

        let mut agv = Agv::new(id, request.name, request.position, request.battery_level, now);
        agv.set_battery(request.battery_level, self.settings.agv.charging_threshold, now);
        self.agvs.insert(agv.id.clone(), agv.clone());

        self.dirty_agvs.insert(agv.id.clone());
        self.notifier.emit(
            EventKind::AgvProvisioned,
            json!({ "agvId": agv.id, "name": agv.name, "position": agv.position }),
        );
        self.flush();
        Ok(agv)
    }

    pub fn decommission_agv(&mut self, agv_id: &str, now: DateTime<Utc>) -> AppResult<()> {
        let mut agv = self
            .agvs
            .shift_remove(agv_id)
            .ok_or_else(|| AppError::not_found(format!("vehicle {agv_id}")))?;
        let released = self.scheduler.detach(&mut agv, now);
        self.latch.release(agv_id);
        self.alerts.forget_agv(agv_id);
        self.dirty_agvs.remove(agv_id);
        self.removed_agvs.push(agv_id.to_string());

        self.notifier.emit(
            EventKind::AgvDecommissioned,
            json!({ "agvId": agv_id, "releasedTaskId": released }),
        );
        self.flush();
        Ok(())
    }

    /// Take a vehicle out of service, or return it. Any task it carried is requeued.
    pub fn set_maintenance(&mut self, agv_id: &str, enabled: bool, now: DateTime<Utc>) -> AppResult<Agv> {
        let threshold = self.settings.agv.charging_threshold;
        let agv = self
            .agvs
            .get_mut(agv_id)
            .ok_or_else(|| AppError::not_found(format!("vehicle {agv_id}")))?;

        let released = if enabled {
            if agv.status == AgvStatus::EmergencyStopped {
                return Err(AppError::invalid_transition(format!(
                    "{agv_id} is emergency stopped; reset it first"
                )));
            }
            let released = self.scheduler.detach(agv, now);
            agv.set_status(AgvStatus::Maintenance, now)?;
            agv.path.clear();
            released
        } else {
            if agv.status != AgvStatus::Maintenance {
                return Err(AppError::invalid_transition(format!(
                    "{} is {:?}, not in maintenance",
                    agv_id, agv.status
                )));
            }
            agv.set_status(AgvStatus::Idle, now)?;
            agv.set_battery(agv.battery_level, threshold, now);
            None
        };
        let agv = agv.clone();

        self.dirty_agvs.insert(agv.id.clone());
        self.notifier.emit(
            EventKind::MaintenanceChanged,
            json!({ "agvId": agv.id, "enabled": enabled, "releasedTaskId": released }),
        );
        self.flush();
        Ok(agv)
    }

    //=========================================================================
    //  Advisor support
    //=========================================================================

    /// Legs currently driven for tasks, excluding latched vehicles.
    pub fn route_requests(&self) -> Vec<RouteRequest> {
        self.agvs
            .values()
            .filter(|agv| agv.status == AgvStatus::ExecutingTask && !self.latch.is_engaged(&agv.id))
            .filter_map(|agv| {
                let task = agv.current_task_id.as_deref().and_then(|id| self.scheduler.get(id))?;
                Some(RouteRequest {
                    agv_id: agv.id.clone(),
                    task_id: task.id.clone(),
                    leg: task.status,
                    from: agv.position,
                    target: task.leg_target(),
                    obstacles: self
                        .agvs
                        .values()
                        .filter(|other| other.id != agv.id)
                        .map(|other| other.position)
                        .collect(),
                })
            })
            .collect()
    }

    /// Install a route computed outside the lock, if the leg it was planned
    /// for is still being driven. Returns whether it was applied.
    pub fn apply_route(&mut self, request: &RouteRequest, route: &Route, now: DateTime<Utc>) -> bool {
        if self.latch.is_engaged(&request.agv_id) {
            debug!("Discarding route for latched {}", request.agv_id);
            return false;
        }
        let Some(agv) = self.agvs.get_mut(&request.agv_id) else {
            return false;
        };
        let still_current = agv.status == AgvStatus::ExecutingTask
            && agv.current_task_id.as_deref() == Some(request.task_id.as_str())
            && self
                .scheduler
                .get(&request.task_id)
                .is_some_and(|t| t.status == request.leg);
        if !still_current {
            debug!("Discarding stale route for {}", request.agv_id);
            return false;
        }
        if let Err(reason) = route.validate(&request.target, &self.settings.yard, self.settings.agv.arrival_epsilon) {
            warn!("Discarding route for {}: {}", request.agv_id, reason);
            return false;
        }

        // A leading waypoint at the vehicle itself is already reached
        let skip = usize::from(
            route.waypoints.len() > 1
                && route.waypoints[0].distance_to(&request.from) <= self.settings.agv.arrival_epsilon,
        );
        agv.path = route.waypoints.iter().skip(skip).copied().collect();
        agv.touch(now);
        self.dirty_agvs.insert(agv.id.clone());
        if let Some(task) = self.scheduler.task_mut(&request.task_id) {
            task.route = Some(route.clone());
        }
        true
    }

    /// Vehicles free for work and pending tasks in scheduling order.
    pub fn pairing_candidates(&self) -> (Vec<Agv>, Vec<Task>) {
        let agvs = self
            .agvs
            .values()
            .filter(|agv| self.scheduler.is_eligible(agv, &self.latch))
            .cloned()
            .collect();
        let tasks = self.scheduler.pending_in_order().into_iter().cloned().collect();
        (agvs, tasks)
    }

    /// Apply suggested pairs that still hold, in scheduling order. Only the
    /// pending tasks that rank within the remaining free slots are considered.
    pub fn apply_pairings(&mut self, pairs: &[Pairing], now: DateTime<Utc>) -> Vec<AssignmentRecord> {
        let free_slots = self
            .settings
            .fleet
            .max_concurrent_tasks
            .saturating_sub(self.scheduler.active_count());
        let rank: HashMap<String, usize> = self
            .scheduler
            .pending_in_order()
            .into_iter()
            .take(free_slots)
            .enumerate()
            .map(|(i, task)| (task.id.clone(), i))
            .collect();
        let mut ordered: Vec<&Pairing> =
            pairs.iter().filter(|p| rank.contains_key(&p.task_id)).collect();
        ordered.sort_by_key(|p| rank.get(&p.task_id).copied());

        let mut applied = Vec::new();
        for pair in ordered {
            let Some(task) = self.scheduler.get(&pair.task_id) else {
                continue;
            };
            let Some(agv) = self.agvs.get(&pair.agv_id) else {
                continue;
            };
            if task.status != TaskStatus::Pending
                || !self.scheduler.is_eligible(agv, &self.latch)
                || !self.scheduler.can_serve(agv, task)
            {
                debug!("Skipping stale pairing {} / {}", pair.agv_id, pair.task_id);
                continue;
            }
            let Some(agv) = self.agvs.get_mut(&pair.agv_id) else {
                continue;
            };
            match self.scheduler.assign(&pair.task_id, agv, now) {
                Ok(record) => {
                    self.dirty_agvs.insert(record.agv_id.clone());
                    self.notifier.emit(
                        EventKind::TaskAssigned,
                        json!({ "taskId": record.task_id, "agvId": record.agv_id, "advised": true }),
                    );
                    applied.push(record);
                }
                Err(AppError::AssignmentCapacityExceeded { .. }) => break,
                Err(e) => debug!("Pairing {} / {} rejected: {}", pair.agv_id, pair.task_id, e),
            }
        }
        if !applied.is_empty() {
            self.flush();
        }
        applied
    }

    //=========================================================================
    //  Persistence
    //=========================================================================

    /// Write dirty records. Failures are logged and the records stay dirty.
    pub fn flush(&mut self) {
        let mut failed = false;

        for agv_id in std::mem::take(&mut self.removed_agvs) {
            if let Err(e) = self.store.remove_agv(&agv_id) {
                self.persistence_failed("remove vehicle", &e);
                self.removed_agvs.push(agv_id);
                failed = true;
            }
        }

        let dirty: Vec<String> = self.dirty_agvs.drain().collect();
        for agv_id in dirty {
            let Some(agv) = self.agvs.get(&agv_id) else {
                continue;
            };
            if let Err(e) = self.store.save_agv_state(agv) {
                self.persistence_failed("save vehicle", &e);
                self.dirty_agvs.insert(agv_id);
                failed = true;
            }
        }

        for task in self.scheduler.take_dirty() {
            if let Err(e) = self.store.save_task_state(&task) {
                self.persistence_failed("save task", &e);
                self.scheduler.mark_dirty(&task.id);
                failed = true;
            }
        }

        if let Err(e) = self.store.flush() {
            self.persistence_failed("flush", &e);
            failed = true;
        }

        if !failed && self.persistence_degraded {
            info!("Persistence recovered");
            self.persistence_degraded = false;
        }
    }

    /// Mark every record dirty and write it out.
    pub fn save_all(&mut self) -> AppResult<()> {
        self.dirty_agvs.extend(self.agvs.keys().cloned());
        self.scheduler.mark_all_dirty();
        self.flush();
        if self.persistence_degraded {
            return Err(AppError::Internal(anyhow::anyhow!(
                "some records could not be saved"
            )));
        }
        Ok(())
    }

    fn persistence_failed(&mut self, what: &str, e: &AppError) {
        warn!("Persistence failure ({}): {}", what, e);
        if !self.persistence_degraded {
            self.persistence_degraded = true;
            self.notifier.emit(
                EventKind::PersistenceDegraded,
                json!({ "operation": what, "error": e.to_string() }),
            );
        }
    }

    fn require_task(&self, id: &str) -> AppResult<&Task> {
        self.scheduler
            .get(id)
            .ok_or_else(|| AppError::not_found(format!("task {id}")))
    }
}

/// Drive one vehicle along its path for a tick, handling pickup, delivery,
/// drain and the low-battery interruption.
fn advance_vehicle(
    agv: &mut Agv,
    scheduler: &mut TaskScheduler,
    notifier: &dyn Notifier,
    cfg: &AgvConfig,
    budget: f64,
    now: DateTime<Utc>,
    report: &mut TickReport,
) {
    let eps = cfg.arrival_epsilon;
    let mut remaining = budget;
    let mut traveled = 0.0;

    for _ in 0..MAX_LEGS_PER_TICK {
        if agv.status == AgvStatus::Moving {
            let progress = motion::follow_path(agv.position, &mut agv.path, remaining, eps);
            agv.position = progress.position;
            traveled += progress.traveled;
            if agv.path.is_empty() {
                if let Err(e) = agv.set_status(AgvStatus::Idle, now) {
                    warn!("{}", e);
                }
                debug!("{} reached its move target", agv.id);
            }
            break;
        }

        let Some(task_id) = agv.current_task_id.clone() else {
            warn!("{} is executing without a task; idling it", agv.id);
            agv.path.clear();
            if let Err(e) = agv.set_status(AgvStatus::Idle, now) {
                warn!("{}", e);
            }
            break;
        };
        let Some((leg, target, destination)) = scheduler
            .get(&task_id)
            .map(|t| (t.status, t.leg_target(), t.destination))
        else {
            break;
        };

        if agv.path.is_empty() {
            agv.path.push_back(target);
        }
        let progress = motion::follow_path(agv.position, &mut agv.path, remaining, eps);
        agv.position = progress.position;
        traveled += progress.traveled;
        remaining = progress.remaining_budget;
        if !agv.path.is_empty() {
            break;
        }
        if agv.position.distance_to(&target) > eps {
            // Route ended short of the target; finish the leg in a straight line
            agv.path.push_back(target);
            continue;
        }

        if leg == TaskStatus::Assigned {
            scheduler.start(&task_id, now);
            agv.path.push_back(destination);
            agv.touch(now);
            notifier.emit(
                EventKind::TaskStarted,
                json!({ "taskId": task_id, "agvId": agv.id, "position": agv.position }),
            );
            report.started.push(task_id);
        } else {
            match scheduler.complete(agv, now) {
                Ok(done) => {
                    notifier.emit(
                        EventKind::TaskCompleted,
                        json!({ "taskId": done, "agvId": agv.id, "position": agv.position }),
                    );
                    report.completed.push(done);
                }
                Err(e) => warn!("Could not complete task {}: {}", task_id, e),
            }
            break;
        }
    }

    if traveled > 0.0 {
        agv.touch(now);
    }
    report.distance_travelled += traveled;

    let level = motion::drain(agv.battery_level, traveled, cfg);
    agv.set_battery(level, cfg.charging_threshold, now);

    if agv.is_active() && agv.battery_level <= cfg.min_battery_level {
        let released = scheduler.detach(agv, now);
        agv.path.clear();
        if let Err(e) = agv.set_status(AgvStatus::Charging, now) {
            warn!("{}", e);
        }
        warn!(
            "{} dropped to {:.1}% and was sent to charge",
            agv.id, agv.battery_level
        );
        notifier.emit(
            EventKind::TaskInterrupted,
            json!({
                "agvId": agv.id,
                "taskId": released,
                "batteryLevel": agv.battery_level,
                "reason": "battery at reserve",
            }),
        );
        if let Some(task_id) = released {
            report.interrupted.push(task_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;
    use crate::{db::app_storage::FleetStorage, notify::EventLog};

    fn engine_with(agvs: &[(&str, f64, f64, f64)], settings: FleetSettings) -> (FleetEngine, Arc<EventLog>) {
        let log = Arc::new(EventLog::new());
        let store = Arc::new(FleetStorage::temporary().unwrap());
        let mut engine = FleetEngine::new(settings, store, log.clone(), EmergencyLatch::default());
        let now = Utc::now();
        for (id, x, y, battery) in agvs {
            engine
                .provision_agv(
                    ProvisionAgvRequest {
                        id: Some(id.to_string()),
                        name: id.to_string(),
                        position: Position::new(*x, *y),
                        battery_level: *battery,
                    },
                    now,
                )
                .unwrap();
        }
        (engine, log)
    }

    fn spec(origin: (f64, f64), destination: (f64, f64)) -> TaskSpec {
        TaskSpec::new(
            Position::new(origin.0, origin.1),
            Position::new(destination.0, destination.1),
            TaskPriority::Normal,
        )
    }

    #[test]
    fn task_runs_from_pickup_to_delivery() {
        let (mut engine, log) = engine_with(&[("AGV-1", 0.0, 0.0, 90.0)], FleetSettings::default());
        let now = Utc::now();
        let task = engine.enqueue_task(spec((50.0, 0.0), (100.0, 0.0)), now).unwrap();

        // Assignment happens after motion, so the first tick only pairs.
        engine.tick(now, 1.0).unwrap();
        assert_eq!(engine.task(&task.id).unwrap().status, TaskStatus::Assigned);

        // 25 km/h for 10 s covers about 69 m: pickup reached, delivery under way.
        engine.tick(now, 10.0).unwrap();
        assert_eq!(engine.task(&task.id).unwrap().status, TaskStatus::InProgress);

        let report = engine.tick(now, 10.0).unwrap();
        assert_eq!(report.completed, vec![task.id.clone()]);
        let agv = engine.agv("AGV-1").unwrap();
        assert_eq!(agv.status, AgvStatus::Idle);
        assert_eq!(agv.position, Position::new(100.0, 0.0));
        assert!(agv.battery_level < 90.0);
        assert_eq!(log.events_of(EventKind::TaskCompleted).len(), 1);
        engine.check_invariants().unwrap();
    }

    #[test]
    fn charging_vehicle_returns_to_service() {
        let (mut engine, _) = engine_with(&[("AGV-1", 0.0, 0.0, 15.0)], FleetSettings::default());
        assert_eq!(engine.agv("AGV-1").unwrap().status, AgvStatus::Charging);

        // 2.5 % per minute; 40 minutes takes it from 15 to 100.
        engine.tick(Utc::now(), 40.0 * 60.0).unwrap();
        let agv = engine.agv("AGV-1").unwrap();
        assert_eq!(agv.status, AgvStatus::Idle);
        assert_eq!(agv.battery_level, 100.0);
    }

    #[test]
    fn emergency_stop_requeues_task_and_is_idempotent() {
        let (mut engine, log) = engine_with(&[("AGV-1", 0.0, 0.0, 90.0)], FleetSettings::default());
        let now = Utc::now();
        let task = engine.enqueue_task(spec((500.0, 0.0), (600.0, 0.0)), now).unwrap();
        engine.assign_now(now);

        assert_eq!(engine.emergency_stop("AGV-1", now).unwrap(), Some(task.id.clone()));
        assert_eq!(engine.emergency_stop("AGV-1", now).unwrap(), None);

        let agv = engine.agv("AGV-1").unwrap();
        assert_eq!(agv.status, AgvStatus::EmergencyStopped);
        assert!(agv.current_task_id.is_none());
        assert_eq!(engine.task(&task.id).unwrap().status, TaskStatus::Pending);
        assert_eq!(log.events_of(EventKind::EmergencyStop).len(), 2);

        // Latched vehicles neither move nor get work.
        let position = agv.position;
        engine.tick(now, 60.0).unwrap();
        assert_eq!(engine.agv("AGV-1").unwrap().position, position);
        assert_eq!(engine.task(&task.id).unwrap().status, TaskStatus::Pending);

        engine.reset_agv("AGV-1", now).unwrap();
        assert!(!engine.latch().is_engaged("AGV-1"));
        assert!(matches!(
            engine.reset_agv("AGV-1", now),
            Err(AppError::InvalidTransition(_))
        ));
    }

    #[test]
    fn manual_move_checks_reserve() {
        let mut settings = FleetSettings::default();
        settings.agv.min_battery_level = 20.0;
        settings.agv.charging_threshold = 20.0;
        let (mut engine, _) = engine_with(&[("AGV-1", 0.0, 0.0, 25.0)], settings);
        let now = Utc::now();

        // 800 m costs 8 %, leaving 17 %.
        assert!(matches!(
            engine.move_agv("AGV-1", Position::new(800.0, 0.0), now),
            Err(AppError::Validation(_))
        ));
        engine.move_agv("AGV-1", Position::new(100.0, 0.0), now).unwrap();
        assert!(matches!(
            engine.move_agv("AGV-1", Position::new(10.0, 0.0), now),
            Err(AppError::InvalidTransition(_))
        ));

        engine.tick(now, 60.0).unwrap();
        let agv = engine.agv("AGV-1").unwrap();
        assert_eq!(agv.status, AgvStatus::Idle);
        assert_eq!(agv.position, Position::new(100.0, 0.0));
    }

    #[test]
    fn emergency_task_is_assigned_immediately() {
        let (mut engine, log) = engine_with(
            &[("AGV-1", 0.0, 0.0, 90.0), ("AGV-2", 300.0, 300.0, 90.0)],
            FleetSettings::default(),
        );
        let (task, record) = engine
            .enqueue_emergency_task(
                EmergencyTaskRequest {
                    origin: Position::new(290.0, 300.0),
                    destination: Position::new(10.0, 10.0),
                    description: "spill at berth 4".to_string(),
                    container_id: None,
                },
                Utc::now(),
            )
            .unwrap();
        assert_eq!(task.priority, TaskPriority::Urgent);
        assert_eq!(task.status, TaskStatus::Assigned);
        assert_eq!(record.unwrap().agv_id, "AGV-2");
        assert_eq!(log.events_of(EventKind::EmergencyTaskCreated).len(), 1);
    }

    #[test]
    fn provisioning_respects_fleet_limit() {
        let mut settings = FleetSettings::default();
        settings.fleet.max_agvs = 1;
        let (mut engine, _) = engine_with(&[("AGV-1", 0.0, 0.0, 90.0)], settings);
        let err = engine
            .provision_agv(
                ProvisionAgvRequest {
                    id: None,
                    name: "extra".to_string(),
                    position: Position::new(1.0, 1.0),
                    battery_level: 100.0,
                },
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[test]
    fn maintenance_and_decommission_release_tasks() {
        let (mut engine, _) = engine_with(
            &[("AGV-1", 0.0, 0.0, 90.0), ("AGV-2", 900.0, 900.0, 90.0)],
            FleetSettings::default(),
        );
        let now = Utc::now();
        let task = engine.enqueue_task(spec((10.0, 0.0), (20.0, 0.0)), now).unwrap();
        engine.assign_now(now);
        assert_eq!(engine.task(&task.id).unwrap().assigned_agv_id.as_deref(), Some("AGV-1"));

        engine.set_maintenance("AGV-1", true, now).unwrap();
        assert_eq!(engine.agv("AGV-1").unwrap().status, AgvStatus::Maintenance);
        assert_eq!(engine.task(&task.id).unwrap().status, TaskStatus::Pending);

        engine.assign_now(now);
        assert_eq!(engine.task(&task.id).unwrap().assigned_agv_id.as_deref(), Some("AGV-2"));
        engine.decommission_agv("AGV-2", now).unwrap();
        assert!(engine.agv("AGV-2").is_none());
        assert_eq!(engine.task(&task.id).unwrap().status, TaskStatus::Pending);

        engine.set_maintenance("AGV-1", false, now).unwrap();
        assert_eq!(engine.agv("AGV-1").unwrap().status, AgvStatus::Idle);
        engine.check_invariants().unwrap();
    }

    #[test]
    fn cancelled_task_is_not_reassigned() {
        let (mut engine, _) = engine_with(&[("AGV-1", 0.0, 0.0, 90.0)], FleetSettings::default());
        let now = Utc::now();
        let task = engine.enqueue_task(spec((10.0, 0.0), (20.0, 0.0)), now).unwrap();
        engine.cancel_task(&task.id, now).unwrap();
        engine.tick(now, 1.0).unwrap();
        assert_eq!(engine.task(&task.id).unwrap().status, TaskStatus::Cancelled);
        assert_eq!(engine.agv("AGV-1").unwrap().status, AgvStatus::Idle);
    }

    #[test]
    fn state_survives_reload() {
        let log = Arc::new(EventLog::new());
        let store: Arc<dyn FleetStore> = Arc::new(FleetStorage::temporary().unwrap());
        let now = Utc::now();
        let task_id = {
            let mut engine = FleetEngine::new(FleetSettings::default(), store.clone(), log.clone(), EmergencyLatch::default());
            engine
                .provision_agv(
                    ProvisionAgvRequest {
                        id: Some("AGV-1".to_string()),
                        name: "one".to_string(),
                        position: Position::new(0.0, 0.0),
                        battery_level: 80.0,
                    },
                    now,
                )
                .unwrap();
            let task = engine.enqueue_task(spec((400.0, 0.0), (500.0, 0.0)), now).unwrap();
            engine.tick(now, 1.0).unwrap();
            engine.emergency_stop("AGV-1", now + TimeDelta::seconds(1)).unwrap();
            task.id
        };

        let latch = EmergencyLatch::default();
        let engine = FleetEngine::load(FleetSettings::default(), store, log, latch.clone());
        assert_eq!(engine.agv("AGV-1").unwrap().status, AgvStatus::EmergencyStopped);
        assert!(latch.is_engaged("AGV-1"));
        assert_eq!(engine.task(&task_id).unwrap().status, TaskStatus::Pending);
        engine.check_invariants().unwrap();
    }

    #[test]
    fn stale_route_is_discarded() {
        let (mut engine, _) = engine_with(&[("AGV-1", 0.0, 0.0, 90.0)], FleetSettings::default());
        let now = Utc::now();
        engine.enqueue_task(spec((300.0, 0.0), (400.0, 0.0)), now).unwrap();
        engine.assign_now(now);

        let request = engine.route_requests().remove(0);
        let route = Route::through(vec![request.from, Position::new(150.0, 50.0), request.target], &engine.settings().agv, now);
        assert!(engine.apply_route(&request, &route, now));
        assert_eq!(engine.agv("AGV-1").unwrap().path.len(), 2);

        engine.emergency_stop("AGV-1", now).unwrap();
        assert!(!engine.apply_route(&request, &route, now));
    }

    #[test]
    fn offset_route_keeps_its_first_waypoint() {
        let (mut engine, _) = engine_with(&[("AGV-1", 0.0, 0.0, 90.0)], FleetSettings::default());
        let now = Utc::now();
        engine.enqueue_task(spec((300.0, 0.0), (400.0, 0.0)), now).unwrap();
        engine.assign_now(now);

        // Starts 40 m from the vehicle: that leg must still be driven
        let request = engine.route_requests().remove(0);
        let detour = Position::new(0.0, 40.0);
        let route = Route::through(vec![detour, Position::new(150.0, 40.0), request.target], &engine.settings().agv, now);
        assert!(engine.apply_route(&request, &route, now));
        let path = &engine.agv("AGV-1").unwrap().path;
        assert_eq!(path.len(), 3);
        assert_eq!(path.front(), Some(&detour));
    }

    #[test]
    fn advised_pairings_follow_priority_at_the_cap() {
        let mut settings = FleetSettings::default();
        settings.fleet.max_concurrent_tasks = 1;
        let (mut engine, _) = engine_with(&[("AGV-1", 0.0, 0.0, 90.0), ("AGV-2", 50.0, 0.0, 90.0)], settings);
        let now = Utc::now();
        let mut low = spec((10.0, 0.0), (20.0, 0.0));
        low.priority = TaskPriority::Low;
        let low = engine.enqueue_task(low, now).unwrap();
        let mut urgent = spec((60.0, 0.0), (70.0, 0.0));
        urgent.priority = TaskPriority::Urgent;
        let urgent = engine.enqueue_task(urgent, now + TimeDelta::seconds(1)).unwrap();

        // Advice lists the LOW task first
        let pairs = vec![
            Pairing { agv_id: "AGV-1".to_string(), task_id: low.id.clone() },
            Pairing { agv_id: "AGV-2".to_string(), task_id: urgent.id.clone() },
        ];
        let applied = engine.apply_pairings(&pairs, now);
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].task_id, urgent.id);
        assert_eq!(engine.task(&urgent.id).unwrap().status, TaskStatus::Assigned);
        assert_eq!(engine.task(&low.id).unwrap().status, TaskStatus::Pending);

        // Advice that skips the top task does not hand its slot to a lower one
        let (mut engine, _) = engine_with(&[("AGV-1", 0.0, 0.0, 90.0)], {
            let mut settings = FleetSettings::default();
            settings.fleet.max_concurrent_tasks = 1;
            settings
        });
        let mut low = spec((10.0, 0.0), (20.0, 0.0));
        low.priority = TaskPriority::Low;
        let low = engine.enqueue_task(low, now).unwrap();
        let mut high = spec((60.0, 0.0), (70.0, 0.0));
        high.priority = TaskPriority::High;
        engine.enqueue_task(high, now).unwrap();
        let only_low = [Pairing { agv_id: "AGV-1".to_string(), task_id: low.id.clone() }];
        assert!(engine.apply_pairings(&only_low, now).is_empty());
        engine.check_invariants().unwrap();
    }
}
