use std::collections::HashSet;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use log::{debug, info};

use crate::{
    config::FleetSettings,
    error::{AppError, AppResult},
    fleet::emergency::EmergencyLatch,
    models::{Agv, AgvStatus, Task, TaskStatus},
    schema::{AssignmentRecord, AssignmentReport, TaskSpec},
    utils::prefixed_uid,
};

/// Owns every task the fleet knows about, in insertion order.
///
/// Vehicles are passed in by the engine for each operation; the scheduler
/// only touches the task back references and the leg path of the vehicles
/// it pairs or releases.
pub struct TaskScheduler {
    tasks: IndexMap<String, Task>,
    dirty: HashSet<String>,
    settings: FleetSettings,
}

impl TaskScheduler {
    pub fn new(settings: FleetSettings) -> Self {
        Self {
            tasks: IndexMap::new(),
            dirty: HashSet::new(),
            settings,
        }
    }

    /// Restore persisted tasks without validation.
    pub fn restore(&mut self, tasks: Vec<Task>) {
        for task in tasks {
            self.tasks.insert(task.id.clone(), task);
        }
    }

    pub fn create_task(&self, spec: TaskSpec, now: DateTime<Utc>) -> Task {
        Task {
            id: spec.id.unwrap_or_else(|| prefixed_uid("TSK")),
            description: spec.description,
            container_id: spec.container_id,
            origin: spec.origin,
            destination: spec.destination,
            priority: spec.priority,
            status: TaskStatus::Pending,
            assigned_agv_id: None,
            created_at: now,
            deadline: spec.deadline.unwrap_or(now + self.settings.fleet.task_timeout),
            started_at: None,
            completed_at: None,
            route: None,
        }
    }

    pub fn enqueue(&mut self, mut task: Task, now: DateTime<Utc>) -> AppResult<String> {
        let yard = &self.settings.yard;
        if !task.origin.is_finite() || !task.destination.is_finite() {
            return Err(AppError::invalid_task("coordinates must be finite"));
        }
        if !task.origin.within(yard) || !task.destination.within(yard) {
            return Err(AppError::invalid_task(format!(
                "coordinates must lie inside the {}x{} yard",
                yard.width, yard.height
            )));
        }
        if task.deadline <= now {
            return Err(AppError::invalid_task("deadline must be in the future"));
        }
        if self.tasks.contains_key(&task.id) {
            return Err(AppError::invalid_task(format!("task {} already exists", task.id)));
        }

        task.status = TaskStatus::Pending;
        task.assigned_agv_id = None;
        let id = task.id.clone();
        debug!("Enqueued task {} ({:?})", id, task.priority);
        self.tasks.insert(id.clone(), task);
        self.dirty.insert(id.clone());
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub(crate) fn task_mut(&mut self, id: &str) -> Option<&mut Task> {
        let task = self.tasks.get_mut(id)?;
        self.dirty.insert(id.to_string());
        Some(task)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn active_count(&self) -> usize {
        self.tasks.values().filter(|t| t.is_active()).count()
    }

    pub fn pending_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .count()
    }

    /// Pending tasks by priority desc, then creation time, then id.
    pub fn pending_in_order(&self) -> Vec<&Task> {
        let mut pending: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .collect();
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        pending
    }

    /// Whether `agv` can drive the round trip for `task` and stay above the reserve.
    pub fn can_serve(&self, agv: &Agv, task: &Task) -> bool {
        let agv_cfg = &self.settings.agv;
        let distance = task.trip_distance_from(&agv.position) * self.settings.fleet.round_trip_factor;
        agv.battery_level - agv_cfg.energy_for(distance) >= agv_cfg.min_battery_level
    }

    /// Whether `agv` could take a new task this instant.
    pub fn is_eligible(&self, agv: &Agv, latch: &EmergencyLatch) -> bool {
        agv.status == AgvStatus::Idle
            && agv.current_task_id.is_none()
            && !latch.is_engaged(&agv.id)
            && agv.battery_level > self.settings.agv.min_battery_level
    }

    /// Pair one task with one vehicle. Either both sides change or neither does.
    pub fn assign(&mut self, task_id: &str, agv: &mut Agv, now: DateTime<Utc>) -> AppResult<AssignmentRecord> {
        let cap = self.settings.fleet.max_concurrent_tasks;
        let active = self.active_count();
        if active >= cap {
            return Err(AppError::AssignmentCapacityExceeded { active, cap });
        }
        let task = self
            .tasks
            .get(task_id)
            .ok_or_else(|| AppError::not_found(format!("task {task_id}")))?;
        if task.status != TaskStatus::Pending {
            return Err(AppError::invalid_transition(format!(
                "task {} is {:?}, not pending",
                task_id, task.status
            )));
        }
        if agv.status != AgvStatus::Idle || agv.current_task_id.is_some() {
            return Err(AppError::invalid_transition(format!(
                "{} is {:?} and cannot take a task",
                agv.id, agv.status
            )));
        }
        let origin = task.origin;

        agv.set_status(AgvStatus::ExecutingTask, now)?;
        agv.current_task_id = Some(task_id.to_string());
        agv.path.clear();
        agv.path.push_back(origin);

        if let Some(task) = self.task_mut(task_id) {
            task.status = TaskStatus::Assigned;
            task.assigned_agv_id = Some(agv.id.clone());
        }

        info!("Assigned task {} to {}", task_id, agv.id);
        Ok(AssignmentRecord {
            task_id: task_id.to_string(),
            agv_id: agv.id.clone(),
            distance_to_origin: agv.position.distance_to(&origin),
        })
    }

    /// Greedy pass: each pending task, most urgent first, takes the nearest
    /// eligible vehicle that can afford the trip.
    pub fn assign_pending(
        &mut self,
        agvs: &mut IndexMap<String, Agv>,
        latch: &EmergencyLatch,
        now: DateTime<Utc>,
    ) -> AssignmentReport {
        let mut report = AssignmentReport::default();
        let cap = self.settings.fleet.max_concurrent_tasks;

        let mut available: Vec<String> = agvs
            .values()
            .filter(|agv| self.is_eligible(agv, latch))
            .map(|agv| agv.id.clone())
            .collect();

        let order: Vec<String> = self.pending_in_order().iter().map(|t| t.id.clone()).collect();
        for task_id in order {
            if self.active_count() >= cap {
                report.capacity_reached = true;
                break;
            }
            if available.is_empty() {
                break;
            }
            let Some(task) = self.tasks.get(&task_id) else {
                continue;
            };

            let chosen = self.nearest_capable(task, available.iter().filter_map(|id| agvs.get(id)));
            let Some(agv_id) = chosen else {
                debug!("No vehicle can serve task {} yet", task_id);
                continue;
            };
            let Some(agv) = agvs.get_mut(&agv_id) else {
                continue;
            };
            match self.assign(&task_id, agv, now) {
                Ok(record) => {
                    available.retain(|id| *id != agv_id);
                    report.assigned.push(record);
                }
                Err(AppError::AssignmentCapacityExceeded { .. }) => {
                    report.capacity_reached = true;
                    break;
                }
                Err(e) => debug!("Skipping task {}: {}", task_id, e),
            }
        }

        report.remaining_pending = self.pending_count();
        report
    }

    /// Closest vehicle to the pickup that can afford the trip, ties by id.
    fn nearest_capable<'a>(&self, task: &Task, candidates: impl Iterator<Item = &'a Agv>) -> Option<String> {
        candidates
            .filter(|agv| self.can_serve(agv, task))
            .map(|agv| (agv.position.distance_to(&task.origin), agv.id.clone()))
            .min_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)))
            .map(|(_, id)| id)
    }

    /// Try to place a single pending task right away. `Ok(None)` when no
    /// vehicle can take it now; it stays queued.
    pub fn assign_best(
        &mut self,
        task_id: &str,
        agvs: &mut IndexMap<String, Agv>,
        latch: &EmergencyLatch,
        now: DateTime<Utc>,
    ) -> AppResult<Option<AssignmentRecord>> {
        let task = self
            .tasks
            .get(task_id)
            .ok_or_else(|| AppError::not_found(format!("task {task_id}")))?;
        let chosen = self.nearest_capable(task, agvs.values().filter(|agv| self.is_eligible(agv, latch)));
        let Some(agv) = chosen.and_then(|id| agvs.get_mut(&id)) else {
            return Ok(None);
        };
        self.assign(task_id, agv, now).map(Some)
    }

    /// Release the vehicle's task back to the queue. Returns the task id.
    pub fn detach(&mut self, agv: &mut Agv, now: DateTime<Utc>) -> Option<String> {
        let task_id = agv.current_task_id.take()?;
        agv.path.clear();
        agv.touch(now);
        if let Some(task) = self.task_mut(&task_id) {
            if task.is_active() {
                task.status = TaskStatus::Pending;
                task.assigned_agv_id = None;
                task.started_at = None;
                task.route = None;
            }
        }
        Some(task_id)
    }

    /// Pickup reached; the vehicle now heads for the destination.
    pub fn start(&mut self, task_id: &str, now: DateTime<Utc>) -> Option<&Task> {
        let task = self.task_mut(task_id)?;
        if task.status == TaskStatus::Assigned {
            task.status = TaskStatus::InProgress;
            task.started_at = Some(now);
            task.route = None;
        }
        self.tasks.get(task_id)
    }

    pub fn complete(&mut self, agv: &mut Agv, now: DateTime<Utc>) -> AppResult<String> {
        let task_id = agv
            .current_task_id
            .take()
            .ok_or_else(|| AppError::invalid_transition(format!("{} has no task", agv.id)))?;
        if let Some(task) = self.task_mut(&task_id) {
            task.status = TaskStatus::Completed;
            task.completed_at = Some(now);
        }
        agv.path.clear();
        agv.set_status(AgvStatus::Idle, now)?;
        Ok(task_id)
    }

    pub fn cancel(&mut self, task_id: &str, agvs: &mut IndexMap<String, Agv>, now: DateTime<Utc>) -> AppResult<()> {
        let task = self
            .tasks
            .get(task_id)
            .ok_or_else(|| AppError::not_found(format!("task {task_id}")))?;
        if !task.is_open() {
            return Err(AppError::invalid_transition(format!(
                "task {} is already {:?}",
                task_id, task.status
            )));
        }
        let agv_id = task.assigned_agv_id.clone();
        if let Some(task) = self.task_mut(task_id) {
            task.status = TaskStatus::Cancelled;
            task.assigned_agv_id = None;
            task.completed_at = Some(now);
        }
        if let Some(agv) = agv_id.as_deref().and_then(|id| agvs.get_mut(id)) {
            release_vehicle(agv, now);
        }
        Ok(())
    }

    /// Fail every open task whose deadline has passed. Returns the failed ids.
    pub fn expire_overdue(&mut self, agvs: &mut IndexMap<String, Agv>, now: DateTime<Utc>) -> Vec<(String, Option<String>)> {
        let overdue: Vec<String> = self
            .tasks
            .values()
            .filter(|t| t.is_open() && t.deadline < now)
            .map(|t| t.id.clone())
            .collect();

        let mut expired = Vec::with_capacity(overdue.len());
        for task_id in overdue {
            let Some(task) = self.task_mut(&task_id) else {
                continue;
            };
            task.status = TaskStatus::Failed;
            task.completed_at = Some(now);
            let agv_id = task.assigned_agv_id.take();
            if let Some(agv) = agv_id.as_deref().and_then(|id| agvs.get_mut(id)) {
                release_vehicle(agv, now);
            }
            info!("Task {} missed its deadline", task_id);
            expired.push((task_id, agv_id));
        }
        expired
    }

    /// Both directions of the vehicle/task reference must agree.
    pub fn check_consistency(&self, agvs: &IndexMap<String, Agv>) -> Result<(), String> {
        for task in self.tasks.values() {
            match (&task.assigned_agv_id, task.is_active()) {
                (Some(agv_id), true) => {
                    let agv = agvs
                        .get(agv_id)
                        .ok_or_else(|| format!("task {} points to unknown vehicle {}", task.id, agv_id))?;
                    if agv.current_task_id.as_deref() != Some(task.id.as_str()) {
                        return Err(format!(
                            "task {} is assigned to {} but the vehicle holds {:?}",
                            task.id, agv_id, agv.current_task_id
                        ));
                    }
                }
                (None, true) => return Err(format!("active task {} has no vehicle", task.id)),
                // Finished tasks keep the vehicle that served them
                (_, false) => {}
            }
        }
        for agv in agvs.values() {
            if !(0.0..=100.0).contains(&agv.battery_level) {
                return Err(format!("{} battery {} out of range", agv.id, agv.battery_level));
            }
            let Some(task_id) = &agv.current_task_id else {
                continue;
            };
            let task = self
                .tasks
                .get(task_id)
                .ok_or_else(|| format!("{} points to unknown task {}", agv.id, task_id))?;
            if !task.is_active() || task.assigned_agv_id.as_deref() != Some(agv.id.as_str()) {
                return Err(format!("{} holds task {} which names {:?}", agv.id, task_id, task.assigned_agv_id));
            }
        }
        Ok(())
    }

    pub(crate) fn mark_dirty(&mut self, id: &str) {
        if self.tasks.contains_key(id) {
            self.dirty.insert(id.to_string());
        }
    }

    pub(crate) fn mark_all_dirty(&mut self) {
        self.dirty.extend(self.tasks.keys().cloned());
    }

    pub(crate) fn take_dirty(&mut self) -> Vec<Task> {
        let ids: Vec<String> = self.dirty.drain().collect();
        ids.iter().filter_map(|id| self.tasks.get(id).cloned()).collect()
    }
}

/// A vehicle whose task ended without finishing returns to idle.
fn release_vehicle(agv: &mut Agv, now: DateTime<Utc>) {
    agv.current_task_id = None;
    agv.path.clear();
    if agv.status == AgvStatus::ExecutingTask {
        agv.status = AgvStatus::Idle;
    }
    agv.touch(now);
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;
    use crate::models::{Position, TaskPriority};

    fn fleet(agvs: &[(&str, f64, f64, f64)]) -> IndexMap<String, Agv> {
        let now = Utc::now();
        agvs.iter()
            .map(|(id, x, y, battery)| {
                (id.to_string(), Agv::new(*id, *id, Position::new(*x, *y), *battery, now))
            })
            .collect()
    }

    fn spec(ox: f64, oy: f64, priority: TaskPriority) -> TaskSpec {
        TaskSpec::new(Position::new(ox, oy), Position::new(ox + 50.0, oy), priority)
    }

    #[test]
    fn rejects_past_deadline_and_bad_coordinates() {
        let mut sched = TaskScheduler::new(FleetSettings::default());
        let now = Utc::now();

        let mut late = spec(10.0, 10.0, TaskPriority::Normal);
        late.deadline = Some(now - TimeDelta::seconds(1));
        let task = sched.create_task(late, now);
        assert!(matches!(sched.enqueue(task, now), Err(AppError::InvalidTask(_))));

        let task = sched.create_task(spec(f64::NAN, 10.0, TaskPriority::Normal), now);
        assert!(matches!(sched.enqueue(task, now), Err(AppError::InvalidTask(_))));

        let task = sched.create_task(spec(5000.0, 10.0, TaskPriority::Normal), now);
        assert!(matches!(sched.enqueue(task, now), Err(AppError::InvalidTask(_))));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let mut sched = TaskScheduler::new(FleetSettings::default());
        let now = Utc::now();
        let mut s = spec(10.0, 10.0, TaskPriority::Normal);
        s.id = Some("TSK-A".to_string());
        let first = sched.create_task(s.clone(), now);
        sched.enqueue(first, now).unwrap();
        let second = sched.create_task(s, now);
        assert!(matches!(sched.enqueue(second, now), Err(AppError::InvalidTask(_))));
    }

    #[test]
    fn equal_priority_goes_first_come_first_served() {
        let mut sched = TaskScheduler::new(FleetSettings::default());
        let t0 = Utc::now();
        let later = sched.create_task(spec(10.0, 10.0, TaskPriority::High), t0 + TimeDelta::seconds(5));
        let earlier = sched.create_task(spec(900.0, 900.0, TaskPriority::High), t0);
        let earlier_id = earlier.id.clone();
        sched.enqueue(later, t0).unwrap();
        sched.enqueue(earlier, t0).unwrap();

        let mut agvs = fleet(&[("AGV-1", 0.0, 0.0, 100.0)]);
        let report = sched.assign_pending(&mut agvs, &EmergencyLatch::default(), t0);
        assert_eq!(report.assigned.len(), 1);
        assert_eq!(report.assigned[0].task_id, earlier_id);
    }

    #[test]
    fn nearest_vehicle_wins_ties_by_id() {
        let mut sched = TaskScheduler::new(FleetSettings::default());
        let now = Utc::now();
        let task = sched.create_task(spec(100.0, 100.0, TaskPriority::Normal), now);
        sched.enqueue(task, now).unwrap();

        let mut agvs = fleet(&[
            ("AGV-B", 110.0, 100.0, 90.0),
            ("AGV-A", 90.0, 100.0, 90.0),
            ("AGV-C", 400.0, 400.0, 90.0),
        ]);
        let report = sched.assign_pending(&mut agvs, &EmergencyLatch::default(), now);
        assert_eq!(report.assigned[0].agv_id, "AGV-A");
        assert_eq!(agvs["AGV-A"].status, AgvStatus::ExecutingTask);
        sched.check_consistency(&agvs).unwrap();
    }

    #[test]
    fn skips_latched_and_underpowered_vehicles() {
        let mut settings = FleetSettings::default();
        settings.agv.min_battery_level = 20.0;
        let mut sched = TaskScheduler::new(settings);
        let now = Utc::now();
        let task = sched.create_task(spec(100.0, 0.0, TaskPriority::Normal), now);
        sched.enqueue(task, now).unwrap();

        // Round trip is (100 + 50) * 2 = 300 m, three percent.
        let mut agvs = fleet(&[("AGV-1", 0.0, 0.0, 22.0), ("AGV-2", 500.0, 500.0, 80.0), ("AGV-3", 0.0, 0.0, 90.0)]);
        let latch = EmergencyLatch::default();
        latch.engage("AGV-3");

        let report = sched.assign_pending(&mut agvs, &latch, now);
        assert_eq!(report.assigned.len(), 1);
        assert_eq!(report.assigned[0].agv_id, "AGV-2");
    }

    #[test]
    fn assign_fails_at_capacity() {
        let mut settings = FleetSettings::default();
        settings.fleet.max_concurrent_tasks = 1;
        let mut sched = TaskScheduler::new(settings);
        let now = Utc::now();
        let a = sched.create_task(spec(10.0, 10.0, TaskPriority::Normal), now);
        let b = sched.create_task(spec(20.0, 10.0, TaskPriority::Normal), now);
        let (a_id, b_id) = (a.id.clone(), b.id.clone());
        sched.enqueue(a, now).unwrap();
        sched.enqueue(b, now).unwrap();

        let mut agvs = fleet(&[("AGV-1", 0.0, 0.0, 90.0), ("AGV-2", 0.0, 0.0, 90.0)]);
        let first = agvs.get_mut("AGV-1").unwrap();
        sched.assign(&a_id, first, now).unwrap();
        let second = agvs.get_mut("AGV-2").unwrap();
        let err = sched.assign(&b_id, second, now).unwrap_err();
        assert!(matches!(err, AppError::AssignmentCapacityExceeded { active: 1, cap: 1 }));
        assert_eq!(agvs["AGV-2"].status, AgvStatus::Idle);
        assert_eq!(sched.get(&b_id).unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn detach_returns_task_to_queue() {
        let mut sched = TaskScheduler::new(FleetSettings::default());
        let now = Utc::now();
        let task = sched.create_task(spec(10.0, 10.0, TaskPriority::Normal), now);
        let id = task.id.clone();
        sched.enqueue(task, now).unwrap();
        let mut agvs = fleet(&[("AGV-1", 0.0, 0.0, 90.0)]);
        sched.assign_pending(&mut agvs, &EmergencyLatch::default(), now);

        let agv = agvs.get_mut("AGV-1").unwrap();
        assert_eq!(sched.detach(agv, now), Some(id.clone()));
        let task = sched.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.assigned_agv_id.is_none());
        assert!(agvs["AGV-1"].current_task_id.is_none());
    }

    #[test]
    fn cancel_frees_vehicle() {
        let mut sched = TaskScheduler::new(FleetSettings::default());
        let now = Utc::now();
        let task = sched.create_task(spec(10.0, 10.0, TaskPriority::Normal), now);
        let id = task.id.clone();
        sched.enqueue(task, now).unwrap();
        let mut agvs = fleet(&[("AGV-1", 0.0, 0.0, 90.0)]);
        sched.assign_pending(&mut agvs, &EmergencyLatch::default(), now);

        sched.cancel(&id, &mut agvs, now).unwrap();
        assert_eq!(sched.get(&id).unwrap().status, TaskStatus::Cancelled);
        assert_eq!(agvs["AGV-1"].status, AgvStatus::Idle);
        assert!(matches!(
            sched.cancel(&id, &mut agvs, now),
            Err(AppError::InvalidTransition(_))
        ));
        sched.check_consistency(&agvs).unwrap();
    }

    #[test]
    fn consistency_check_catches_one_sided_reference() {
        let mut sched = TaskScheduler::new(FleetSettings::default());
        let now = Utc::now();
        let task = sched.create_task(spec(10.0, 10.0, TaskPriority::Normal), now);
        let id = task.id.clone();
        sched.enqueue(task, now).unwrap();
        let mut agvs = fleet(&[("AGV-1", 0.0, 0.0, 90.0)]);
        agvs.get_mut("AGV-1").unwrap().current_task_id = Some(id);
        assert!(sched.check_consistency(&agvs).is_err());
    }
}
