use std::{
    collections::HashSet,
    sync::Arc,
    time::{Duration, Instant},
};

use log::{info, warn};
use serde_json::json;

use crate::{
    advisor::{Pairing, RouteAdvisor, heuristic::LocalHeuristicAdvisor, http::HttpRouteAdvisor},
    config::FleetSettings,
    error::AppError,
    models::{Agv, Position, Route, Task},
    notify::{EventKind, Notifier},
    schema::RouteSource,
};

/// Bounds, validates and records every advisor call; never fails.
pub struct RouteAdvisorGateway {
    advisor: Option<Arc<dyn RouteAdvisor>>,
    fallback: LocalHeuristicAdvisor,
    timeout: Duration,
    settings: FleetSettings,
    notifier: Arc<dyn Notifier>,
}

enum Outcome<T> {
    Accepted(T),
    Rejected(String),
}

impl RouteAdvisorGateway {
    pub fn new(
        settings: &FleetSettings,
        advisor: Option<Arc<dyn RouteAdvisor>>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            advisor,
            fallback: LocalHeuristicAdvisor::new(settings.agv.clone(), settings.yard.clone()),
            timeout: settings.advisor.timeout,
            settings: settings.clone(),
            notifier,
        }
    }

    /// HTTP advisor when enabled and configured, otherwise heuristic only.
    pub fn from_settings(settings: &FleetSettings, notifier: Arc<dyn Notifier>) -> Self {
        let advisor: Option<Arc<dyn RouteAdvisor>> = match (&settings.advisor.url, settings.advisor.enabled) {
            (Some(url), true) => {
                info!("Route advisor at {} (timeout {:?})", url, settings.advisor.timeout);
                Some(Arc::new(HttpRouteAdvisor::new(url.clone(), settings.agv.clone())))
            }
            _ => {
                info!("Route advisor disabled; using local heuristic");
                None
            }
        };
        Self::new(settings, advisor, notifier)
    }

    pub fn heuristic(&self) -> &LocalHeuristicAdvisor {
        &self.fallback
    }

    pub async fn route(&self, origin: Position, destination: Position, obstacles: &[Position]) -> (Route, RouteSource) {
        let started = Instant::now();
        let outcome = match &self.advisor {
            None => Outcome::Rejected("disabled".to_string()),
            Some(advisor) => {
                match tokio::time::timeout(self.timeout, advisor.suggest_route(origin, destination, obstacles)).await {
                    Err(_) => Outcome::Rejected("timeout".to_string()),
                    Ok(Err(e)) => Outcome::Rejected(format!("error: {e:#}")),
                    Ok(Ok(route)) => match self.check_route(&route, &origin, &destination) {
                        Ok(()) => Outcome::Accepted(route),
                        Err(reason) => Outcome::Rejected(format!("invalid: {reason}")),
                    },
                }
            }
        };

        let (route, source, outcome) = match outcome {
            Outcome::Accepted(route) => (route, RouteSource::Advisor, "ok".to_string()),
            Outcome::Rejected(reason) => (
                self.fallback.straight_route(origin, destination),
                RouteSource::Fallback,
                reason,
            ),
        };
        self.record("route", source, started, &outcome);
        (route, source)
    }

    pub async fn assignment(&self, agvs: &[Agv], tasks: &[Task]) -> (Vec<Pairing>, RouteSource) {
        let started = Instant::now();
        let outcome = match &self.advisor {
            None => Outcome::Rejected("disabled".to_string()),
            Some(advisor) => match tokio::time::timeout(self.timeout, advisor.suggest_assignment(agvs, tasks)).await {
                Err(_) => Outcome::Rejected("timeout".to_string()),
                Ok(Err(e)) => Outcome::Rejected(format!("error: {e:#}")),
                Ok(Ok(pairs)) => match check_pairings(&pairs, agvs, tasks) {
                    Ok(()) => Outcome::Accepted(pairs),
                    Err(reason) => Outcome::Rejected(format!("invalid: {reason}")),
                },
            },
        };

        let (pairs, source, outcome) = match outcome {
            Outcome::Accepted(pairs) => (pairs, RouteSource::Advisor, "ok".to_string()),
            Outcome::Rejected(reason) => (self.fallback.nearest_pairs(agvs, tasks), RouteSource::Fallback, reason),
        };
        self.record("assignment", source, started, &outcome);
        (pairs, source)
    }

    fn check_route(&self, route: &Route, origin: &Position, destination: &Position) -> Result<(), String> {
        route.validate(destination, &self.settings.yard, self.settings.agv.arrival_epsilon)?;
        let first = route.waypoints.first().ok_or("route has no waypoints")?;
        // The first leg starts from the vehicle itself
        if first.distance_to(origin) > self.settings.yard.max_route_leg {
            return Err("route starts too far from the vehicle".to_string());
        }
        Ok(())
    }

    fn record(&self, operation: &str, source: RouteSource, started: Instant, outcome: &str) {
        let latency_ms = started.elapsed().as_millis() as u64;
        if source == RouteSource::Fallback && outcome != "disabled" {
            warn!(
                "{}",
                AppError::advisor_unavailable(format!("{operation} fell back to heuristic: {outcome}"))
            );
        }
        self.notifier.emit(
            EventKind::AdvisorCall,
            json!({
                "operation": operation,
                "source": source,
                "latencyMs": latency_ms,
                "outcome": outcome,
            }),
        );
    }
}

fn check_pairings(pairs: &[Pairing], agvs: &[Agv], tasks: &[Task]) -> Result<(), String> {
    let known_agvs: HashSet<&str> = agvs.iter().map(|a| a.id.as_str()).collect();
    let known_tasks: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    let mut seen_agvs = HashSet::new();
    let mut seen_tasks = HashSet::new();
    for pair in pairs {
        if !known_agvs.contains(pair.agv_id.as_str()) || !known_tasks.contains(pair.task_id.as_str()) {
            return Err(format!("unknown pair {} / {}", pair.agv_id, pair.task_id));
        }
        if !seen_agvs.insert(pair.agv_id.as_str()) || !seen_tasks.insert(pair.task_id.as_str()) {
            return Err(format!("duplicate pair {} / {}", pair.agv_id, pair.task_id));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::notify::EventLog;

    struct SlowAdvisor;

    #[async_trait]
    impl RouteAdvisor for SlowAdvisor {
        async fn suggest_route(&self, _: Position, _: Position, _: &[Position]) -> anyhow::Result<Route> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            anyhow::bail!("never reached")
        }

        async fn suggest_assignment(&self, _: &[Agv], _: &[Task]) -> anyhow::Result<Vec<Pairing>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Vec::new())
        }
    }

    /// Answers with a route that leaves the yard.
    struct WildAdvisor;

    #[async_trait]
    impl RouteAdvisor for WildAdvisor {
        async fn suggest_route(&self, origin: Position, destination: Position, _: &[Position]) -> anyhow::Result<Route> {
            let waypoints = vec![origin, Position::new(-500.0, -500.0), destination];
            Ok(Route::through(waypoints, &Default::default(), Utc::now()))
        }

        async fn suggest_assignment(&self, agvs: &[Agv], tasks: &[Task]) -> anyhow::Result<Vec<Pairing>> {
            // Same vehicle twice
            Ok(tasks
                .iter()
                .map(|t| Pairing {
                    agv_id: agvs[0].id.clone(),
                    task_id: t.id.clone(),
                })
                .collect())
        }
    }

    fn gateway(advisor: Arc<dyn RouteAdvisor>, log: Arc<EventLog>) -> RouteAdvisorGateway {
        let mut settings = FleetSettings::default();
        settings.advisor.timeout = Duration::from_millis(50);
        RouteAdvisorGateway::new(&settings, Some(advisor), log)
    }

    #[tokio::test]
    async fn slow_advisor_falls_back_within_timeout() {
        let log = Arc::new(EventLog::new());
        let gw = gateway(Arc::new(SlowAdvisor), log.clone());
        let dest = Position::new(300.0, 40.0);

        let started = Instant::now();
        let (route, source) = gw.route(Position::new(10.0, 10.0), dest, &[]).await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(source, RouteSource::Fallback);
        assert!(!route.waypoints.is_empty());

        let calls = log.events_of(EventKind::AdvisorCall);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].payload["outcome"], "timeout");
        assert_eq!(calls[0].payload["source"], "fallback");
    }

    #[tokio::test]
    async fn invalid_answers_are_replaced() {
        let log = Arc::new(EventLog::new());
        let gw = gateway(Arc::new(WildAdvisor), log.clone());
        let dest = Position::new(300.0, 40.0);

        let (route, source) = gw.route(Position::new(10.0, 10.0), dest, &[]).await;
        assert_eq!(source, RouteSource::Fallback);
        assert!(route.waypoints.iter().all(|p| p.x >= 0.0 && p.y >= 0.0));

        let now = Utc::now();
        let agvs = vec![
            Agv::new("AGV-1", "one", Position::new(0.0, 0.0), 90.0, now),
            Agv::new("AGV-2", "two", Position::new(50.0, 0.0), 90.0, now),
        ];
        let task = |id: &str| Task {
            id: id.to_string(),
            description: None,
            container_id: None,
            origin: Position::new(10.0, 0.0),
            destination: Position::new(20.0, 0.0),
            priority: crate::models::TaskPriority::Normal,
            status: crate::models::TaskStatus::Pending,
            assigned_agv_id: None,
            created_at: now,
            deadline: now + chrono::TimeDelta::minutes(60),
            started_at: None,
            completed_at: None,
            route: None,
        };
        let (pairs, source) = gw.assignment(&agvs, &[task("T1"), task("T2")]).await;
        assert_eq!(source, RouteSource::Fallback);
        assert_eq!(pairs.len(), 2);
        assert_ne!(pairs[0].agv_id, pairs[1].agv_id);
    }

    #[tokio::test]
    async fn disabled_advisor_uses_heuristic_and_records_it() {
        let log = Arc::new(EventLog::new());
        let gw = RouteAdvisorGateway::new(&FleetSettings::default(), None, log.clone());
        let (_, source) = gw.route(Position::new(0.0, 0.0), Position::new(5.0, 5.0), &[]).await;
        assert_eq!(source, RouteSource::Fallback);
        assert_eq!(log.events_of(EventKind::AdvisorCall)[0].payload["outcome"], "disabled");
    }
}
