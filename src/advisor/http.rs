use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    advisor::{Pairing, RouteAdvisor},
    config::AgvConfig,
    models::{Agv, Position, Route, Task},
};

/// Talks to an optimizer service over JSON/HTTP.
///
/// `POST {base}/route` with `{origin, destination, obstacles}` answers
/// `{waypoints, totalDistance?, estimatedMinutes?, energyCost?}`;
/// `POST {base}/assignment` with `{agvs, tasks}` answers `{pairings}`.
/// Timeouts are enforced by the gateway, not here.
pub struct HttpRouteAdvisor {
    client: reqwest::Client,
    base_url: String,
    agv: AgvConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RouteResponse {
    waypoints: Vec<Position>,
    total_distance: Option<f64>,
    estimated_minutes: Option<f64>,
    energy_cost: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct AssignmentResponse {
    pairings: Vec<Pairing>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AgvSummary<'a> {
    id: &'a str,
    position: Position,
    battery_level: f64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskSummary<'a> {
    id: &'a str,
    origin: Position,
    destination: Position,
    priority: crate::models::TaskPriority,
}

impl HttpRouteAdvisor {
    pub fn new(base_url: impl Into<String>, agv: AgvConfig) -> Self {
        let base_url: String = base_url.into();
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            agv,
        }
    }

    async fn post<T: serde::de::DeserializeOwned>(&self, path: &str, body: serde_json::Value) -> anyhow::Result<T> {
        let url = format!("{}/{}", self.base_url, path);
        log::debug!("Calling route advisor at {}", url);

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Failed to reach route advisor at {url}"))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            anyhow::bail!("Route advisor error (status {}): {}", status, error_text);
        }

        response
            .json()
            .await
            .context("Failed to parse route advisor response")
    }
}

#[async_trait]
impl RouteAdvisor for HttpRouteAdvisor {
    async fn suggest_route(
        &self,
        origin: Position,
        destination: Position,
        obstacles: &[Position],
    ) -> anyhow::Result<Route> {
        let body = json!({
            "origin": origin,
            "destination": destination,
            "obstacles": obstacles,
        });
        let answer: RouteResponse = self.post("route", body).await?;

        let mut route = Route::through(answer.waypoints, &self.agv, Utc::now());
        // Reported figures win so that nonsense from the service gets caught by validation
        if let Some(distance) = answer.total_distance {
            route.total_distance = distance;
        }
        if let Some(minutes) = answer.estimated_minutes {
            route.estimated_minutes = minutes;
        }
        if let Some(energy) = answer.energy_cost {
            route.energy_cost = energy;
        }
        Ok(route)
    }

    async fn suggest_assignment(&self, agvs: &[Agv], tasks: &[Task]) -> anyhow::Result<Vec<Pairing>> {
        let agvs: Vec<AgvSummary> = agvs
            .iter()
            .map(|a| AgvSummary {
                id: &a.id,
                position: a.position,
                battery_level: a.battery_level,
            })
            .collect();
        let tasks: Vec<TaskSummary> = tasks
            .iter()
            .map(|t| TaskSummary {
                id: &t.id,
                origin: t.origin,
                destination: t.destination,
                priority: t.priority,
            })
            .collect();
        let answer: AssignmentResponse = self
            .post("assignment", json!({ "agvs": agvs, "tasks": tasks }))
            .await?;
        Ok(answer.pairings)
    }
}
