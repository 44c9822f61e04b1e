use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use agvfleet::{
    advisor::{Pairing, RouteAdvisor, gateway::RouteAdvisorGateway},
    config::FleetSettings,
    db::{FleetStore, app_storage::FleetStorage},
    fleet::{EmergencyLatch, FleetEngine, FleetHandle},
    models::{Agv, AgvStatus, Position, Route, Task, TaskPriority, TaskStatus},
    notify::{EventKind, EventLog},
    schema::{ProvisionAgvRequest, RouteSource, TaskSpec},
};
use async_trait::async_trait;
use chrono::{TimeDelta, Utc};

fn provision(engine: &mut FleetEngine, id: &str, x: f64, y: f64, battery: f64) {
    engine
        .provision_agv(
            ProvisionAgvRequest {
                id: Some(id.to_string()),
                name: id.to_string(),
                position: Position::new(x, y),
                battery_level: battery,
            },
            Utc::now(),
        )
        .unwrap();
}

fn empty_engine(settings: FleetSettings) -> (FleetEngine, Arc<EventLog>) {
    let log = Arc::new(EventLog::new());
    let store = Arc::new(FleetStorage::temporary().unwrap());
    let engine = FleetEngine::new(settings, store, log.clone(), EmergencyLatch::default());
    (engine, log)
}

#[test]
fn vehicle_at_reserve_is_sent_to_charge_and_task_requeued() {
    let mut settings = FleetSettings::default();
    settings.agv.min_battery_level = 20.0;
    settings.agv.charging_threshold = 20.0;
    settings.alerts.low_battery_threshold = 20.0;

    let now = Utc::now();
    let store = Arc::new(FleetStorage::temporary().unwrap());

    let mut agv = Agv::new("AGV-001", "Shuttle 1", Position::new(0.0, 0.0), 25.0, now);
    agv.status = AgvStatus::ExecutingTask;
    agv.current_task_id = Some("TASK-FAR".to_string());
    let task = Task {
        id: "TASK-FAR".to_string(),
        description: None,
        container_id: None,
        origin: Position::new(900.0, 900.0),
        destination: Position::new(100.0, 900.0),
        priority: TaskPriority::Normal,
        status: TaskStatus::Assigned,
        assigned_agv_id: Some("AGV-001".to_string()),
        created_at: now,
        deadline: now + TimeDelta::hours(2),
        started_at: None,
        completed_at: None,
        route: None,
    };
    store.save_agv_state(&agv).unwrap();
    store.append_task(&task).unwrap();

    let log = Arc::new(EventLog::new());
    let mut engine = FleetEngine::load(settings, store, log.clone(), EmergencyLatch::default());
    engine.check_invariants().unwrap();

    // 120 s at 25 km/h is about 833 m, i.e. 8.3 % of charge
    let report = engine.tick(now, 120.0).unwrap();
    assert_eq!(report.interrupted, vec!["TASK-FAR".to_string()]);

    let agv = engine.agv("AGV-001").unwrap();
    assert_eq!(agv.status, AgvStatus::Charging);
    assert!(agv.current_task_id.is_none());
    assert!(agv.battery_level <= 20.0);

    let task = engine.task("TASK-FAR").unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.assigned_agv_id.is_none());

    assert_eq!(log.events_of(EventKind::LowBattery).len(), 1);
    assert_eq!(log.events_of(EventKind::TaskInterrupted).len(), 1);

    // Still low on the next tick, but the alert is not repeated
    engine.tick(now + TimeDelta::seconds(1), 1.0).unwrap();
    assert_eq!(log.events_of(EventKind::LowBattery).len(), 1);
    engine.check_invariants().unwrap();
}

struct SlowAdvisor;

#[async_trait]
impl RouteAdvisor for SlowAdvisor {
    async fn suggest_route(&self, _: Position, _: Position, _: &[Position]) -> anyhow::Result<Route> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        anyhow::bail!("too late")
    }

    async fn suggest_assignment(&self, _: &[Agv], _: &[Task]) -> anyhow::Result<Vec<Pairing>> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn slow_advisor_falls_back_within_the_timeout() {
    let mut settings = FleetSettings::default();
    settings.advisor.timeout = Duration::from_millis(50);
    let (mut engine, log) = empty_engine(settings.clone());
    provision(&mut engine, "AGV-001", 10.0, 10.0, 90.0);

    let gateway = RouteAdvisorGateway::new(&settings, Some(Arc::new(SlowAdvisor)), log.clone());
    let fleet = FleetHandle::new(engine, gateway);

    fleet
        .enqueue_task(TaskSpec::new(
            Position::new(200.0, 10.0),
            Position::new(200.0, 300.0),
            TaskPriority::High,
        ))
        .await
        .unwrap();
    assert_eq!(fleet.assign_now().await.assigned.len(), 1);

    let started = Instant::now();
    let report = fleet.request_route_optimization().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));

    assert_eq!(report.routes.len(), 1);
    let suggestion = &report.routes[0];
    assert_eq!(suggestion.source, RouteSource::Fallback);
    assert!(suggestion.applied);
    assert!(!suggestion.route.waypoints.is_empty());
    assert_eq!(suggestion.route.waypoints.first(), Some(&Position::new(10.0, 10.0)));
    assert_eq!(suggestion.route.waypoints.last(), Some(&Position::new(200.0, 10.0)));
    assert!(
        suggestion
            .route
            .validate(&Position::new(200.0, 10.0), &settings.yard, settings.agv.arrival_epsilon)
            .is_ok()
    );

    let calls = log.events_of(EventKind::AdvisorCall);
    assert!(calls.iter().any(|e| e.payload["outcome"] == "timeout"));
}

#[test]
fn assignment_stops_at_the_concurrency_cap() {
    let mut settings = FleetSettings::default();
    settings.fleet.max_concurrent_tasks = 3;
    let (mut engine, _log) = empty_engine(settings);
    provision(&mut engine, "AGV-001", 0.0, 0.0, 95.0);
    provision(&mut engine, "AGV-002", 100.0, 0.0, 95.0);
    provision(&mut engine, "AGV-003", 200.0, 0.0, 95.0);

    let now = Utc::now();
    let ids: Vec<String> = (0..5)
        .map(|i| {
            let x = 20.0 + 40.0 * i as f64;
            engine
                .enqueue_task(
                    TaskSpec::new(Position::new(x, 20.0), Position::new(x, 80.0), TaskPriority::Normal),
                    now,
                )
                .unwrap()
                .id
        })
        .collect();

    let report = engine.assign_now(now);
    assert_eq!(report.assigned.len(), 3);
    assert_eq!(report.remaining_pending, 2);
    assert!(report.capacity_reached);

    let statuses: Vec<TaskStatus> = ids.iter().map(|id| engine.task(id).unwrap().status).collect();
    assert_eq!(statuses.iter().filter(|s| **s == TaskStatus::Assigned).count(), 3);
    assert_eq!(statuses.iter().filter(|s| **s == TaskStatus::Pending).count(), 2);

    let mut holders: Vec<&str> = report.assigned.iter().map(|a| a.agv_id.as_str()).collect();
    holders.sort();
    holders.dedup();
    assert_eq!(holders.len(), 3);

    // Another round changes nothing while the cap is reached
    assert!(engine.assign_now(now).assigned.is_empty());
    engine.check_invariants().unwrap();
}

#[test]
fn overdue_task_fails_and_is_not_retried() {
    let (mut engine, log) = empty_engine(FleetSettings::default());
    provision(&mut engine, "AGV-001", 0.0, 0.0, 95.0);

    let now = Utc::now();
    let mut spec = TaskSpec::new(Position::new(10.0, 0.0), Position::new(900.0, 0.0), TaskPriority::Normal);
    spec.deadline = Some(now + TimeDelta::seconds(60));
    let task = engine.enqueue_task(spec, now).unwrap();

    engine.tick(now, 1.0).unwrap();
    assert_eq!(engine.task(&task.id).unwrap().status, TaskStatus::Assigned);

    // About 35 m: pickup reached, delivery under way
    engine.tick(now + TimeDelta::seconds(5), 5.0).unwrap();
    assert_eq!(engine.task(&task.id).unwrap().status, TaskStatus::InProgress);

    let report = engine.tick(now + TimeDelta::seconds(90), 1.0).unwrap();
    assert_eq!(report.expired, vec![task.id.clone()]);

    let failed = engine.task(&task.id).unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    let agv = engine.agv("AGV-001").unwrap();
    assert_eq!(agv.status, AgvStatus::Idle);
    assert!(agv.current_task_id.is_none());
    assert_eq!(log.events_of(EventKind::TaskFailed).len(), 1);

    for i in 0..3 {
        let report = engine.tick(now + TimeDelta::seconds(100 + i), 1.0).unwrap();
        assert!(report.assignment.assigned.is_empty());
        assert!(report.expired.is_empty());
    }
    assert_eq!(engine.task(&task.id).unwrap().status, TaskStatus::Failed);
    assert_eq!(engine.agv("AGV-001").unwrap().status, AgvStatus::Idle);
    assert_eq!(engine.tick_count(), 6);
    engine.check_invariants().unwrap();
}
