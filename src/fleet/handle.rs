use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::info;
use tokio::sync::{Mutex, watch};

use crate::{
    advisor::gateway::RouteAdvisorGateway,
    error::{AppError, AppResult},
    fleet::{emergency::EmergencyLatch, engine::FleetEngine, insights},
    models::{Agv, FleetSnapshot, Position, Task},
    schema::{
        AssignmentRecord, AssignmentReport, EmergencyTaskRequest, InsightsReport, OptimizationReport,
        ProvisionAgvRequest, RouteSource, RouteSuggestion, TaskSpec, TickReport,
    },
};

/// Cloneable entry point to the fleet. Every mutation takes the engine lock;
/// readers use the published snapshot and never wait on it.
#[derive(Clone)]
pub struct FleetHandle {
    engine: Arc<Mutex<FleetEngine>>,
    latch: EmergencyLatch,
    gateway: Arc<RouteAdvisorGateway>,
    snapshots: Arc<watch::Sender<Arc<FleetSnapshot>>>,
}

impl FleetHandle {
    pub fn new(engine: FleetEngine, gateway: RouteAdvisorGateway) -> Self {
        let latch = engine.latch().clone();
        let (tx, _) = watch::channel(Arc::new(engine.snapshot(Utc::now())));
        Self {
            engine: Arc::new(Mutex::new(engine)),
            latch,
            gateway: Arc::new(gateway),
            snapshots: Arc::new(tx),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<FleetSnapshot>> {
        self.snapshots.subscribe()
    }

    /// Last published snapshot.
    pub fn get_fleet_snapshot(&self) -> Arc<FleetSnapshot> {
        self.snapshots.borrow().clone()
    }

    fn publish(&self, engine: &FleetEngine) -> Arc<FleetSnapshot> {
        let snapshot = Arc::new(engine.snapshot(Utc::now()));
        self.snapshots.send_replace(snapshot.clone());
        snapshot
    }

    pub async fn refresh_snapshot(&self) -> Arc<FleetSnapshot> {
        let engine = self.engine.lock().await;
        self.publish(&engine)
    }

    pub async fn tick(&self, tick_seconds: f64) -> AppResult<TickReport> {
        self.tick_at(Utc::now(), tick_seconds).await
    }

    pub async fn tick_at(&self, now: DateTime<Utc>, tick_seconds: f64) -> AppResult<TickReport> {
        let mut engine = self.engine.lock().await;
        let report = engine.tick(now, tick_seconds);
        self.publish(&engine);
        report
    }

    pub async fn enqueue_task(&self, spec: TaskSpec) -> AppResult<Task> {
        let mut engine = self.engine.lock().await;
        let task = engine.enqueue_task(spec, Utc::now())?;
        self.publish(&engine);
        Ok(task)
    }

    pub async fn enqueue_emergency_task(
        &self,
        request: EmergencyTaskRequest,
    ) -> AppResult<(Task, Option<AssignmentRecord>)> {
        let mut engine = self.engine.lock().await;
        let result = engine.enqueue_emergency_task(request, Utc::now())?;
        self.publish(&engine);
        Ok(result)
    }

    pub async fn cancel_task(&self, task_id: &str) -> AppResult<Task> {
        let mut engine = self.engine.lock().await;
        let task = engine.cancel_task(task_id, Utc::now())?;
        self.publish(&engine);
        Ok(task)
    }

    pub async fn assign_now(&self) -> AssignmentReport {
        let mut engine = self.engine.lock().await;
        let report = engine.assign_now(Utc::now());
        self.publish(&engine);
        report
    }

    pub async fn move_agv(&self, agv_id: &str, target: Position) -> AppResult<Agv> {
        let mut engine = self.engine.lock().await;
        let agv = engine.move_agv(agv_id, target, Utc::now())?;
        self.publish(&engine);
        Ok(agv)
    }

    /// Latches the vehicle before waiting for the engine, so an in-flight
    /// tick already leaves it alone.
    pub async fn emergency_stop(&self, agv_id: &str) -> AppResult<Option<String>> {
        self.latch.engage(agv_id);
        let mut engine = self.engine.lock().await;
        match engine.emergency_stop(agv_id, Utc::now()) {
            Ok(released) => {
                self.publish(&engine);
                Ok(released)
            }
            Err(e) => {
                if engine.agv(agv_id).is_none() {
                    self.latch.release(agv_id);
                }
                Err(e)
            }
        }
    }

    pub async fn reset_agv(&self, agv_id: &str) -> AppResult<Agv> {
        let mut engine = self.engine.lock().await;
        let agv = engine.reset_agv(agv_id, Utc::now())?;
        self.publish(&engine);
        Ok(agv)
    }

    pub async fn provision_agv(&self, request: ProvisionAgvRequest) -> AppResult<Agv> {
        let mut engine = self.engine.lock().await;
        let agv = engine.provision_agv(request, Utc::now())?;
        self.publish(&engine);
        Ok(agv)
    }

    pub async fn decommission_agv(&self, agv_id: &str) -> AppResult<()> {
        let mut engine = self.engine.lock().await;
        engine.decommission_agv(agv_id, Utc::now())?;
        self.publish(&engine);
        Ok(())
    }

    pub async fn set_maintenance(&self, agv_id: &str, enabled: bool) -> AppResult<Agv> {
        let mut engine = self.engine.lock().await;
        let agv = engine.set_maintenance(agv_id, enabled, Utc::now())?;
        self.publish(&engine);
        Ok(agv)
    }

    /// Ask the advisor for fresh routes on every active leg and for pairings
    /// of pending work. The advisor runs without the engine lock; its answers
    /// are re-checked against the engine before they are applied.
    pub async fn request_route_optimization(&self) -> AppResult<OptimizationReport> {
        let requested_at = Utc::now();
        let (requests, (free_agvs, pending)) = {
            let engine = self.engine.lock().await;
            (engine.route_requests(), engine.pairing_candidates())
        };

        // Routes and pairings are requested concurrently; the call waits at
        // most one advisor timeout.
        let gateway = &self.gateway;
        let route_batch = join_all(
            requests
                .iter()
                .map(|r| gateway.route(r.from, r.target, &r.obstacles)),
        );
        let pairing = async {
            if free_agvs.is_empty() || pending.is_empty() {
                (Vec::new(), RouteSource::Fallback)
            } else {
                gateway.assignment(&free_agvs, &pending).await
            }
        };
        let (routes, (pairs, assignment_source)) = tokio::join!(route_batch, pairing);

        let mut engine = self.engine.lock().await;
        let now = Utc::now();
        let suggestions = requests
            .iter()
            .zip(routes)
            .map(|(request, (route, source))| RouteSuggestion {
                agv_id: request.agv_id.clone(),
                task_id: request.task_id.clone(),
                applied: engine.apply_route(request, &route, now),
                route,
                source,
            })
            .collect::<Vec<_>>();
        let assignments = engine.apply_pairings(&pairs, now);
        let congestion_zones = gateway
            .heuristic()
            .congestion_zones(suggestions.iter().map(|s| &s.route));
        engine.flush();
        self.publish(&engine);

        info!(
            "Route optimization: {} routes ({} applied), {} advised assignments",
            suggestions.len(),
            suggestions.iter().filter(|s| s.applied).count(),
            assignments.len()
        );
        Ok(OptimizationReport {
            requested_at,
            routes: suggestions,
            assignments,
            assignment_source,
            congestion_zones,
        })
    }

    pub async fn request_insights(&self) -> InsightsReport {
        let snapshot = self.refresh_snapshot().await;
        insights::analyze(&snapshot, Utc::now())
    }

    pub fn agv(&self, agv_id: &str) -> AppResult<Agv> {
        self.get_fleet_snapshot()
            .agv(agv_id)
            .cloned()
            .ok_or_else(|| AppError::not_found(format!("vehicle {agv_id}")))
    }

    pub fn task(&self, task_id: &str) -> AppResult<Task> {
        self.get_fleet_snapshot()
            .task(task_id)
            .cloned()
            .ok_or_else(|| AppError::not_found(format!("task {task_id}")))
    }

    pub async fn save_all(&self) -> AppResult<()> {
        self.engine.lock().await.save_all()
    }
}
