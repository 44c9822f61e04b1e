//! Route and assignment suggestions from an external optimizer.
//!
//! The optimizer is treated as an untrusted oracle: it may be slow, fail or
//! answer nonsense. [`gateway::RouteAdvisorGateway`] bounds every call with a
//! timeout, validates the answer and falls back to
//! [`heuristic::LocalHeuristicAdvisor`] when anything goes wrong.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{Agv, Position, Route, Task};

pub mod gateway;
pub mod heuristic;
pub mod http;

/// One suggested vehicle/task pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Pairing {
    pub agv_id: String,
    pub task_id: String,
}

#[async_trait]
pub trait RouteAdvisor: Send + Sync {
    /// Waypoints from `origin` to `destination`, avoiding `obstacles` where possible.
    async fn suggest_route(
        &self,
        origin: Position,
        destination: Position,
        obstacles: &[Position],
    ) -> anyhow::Result<Route>;

    /// Pairs drawn from `agvs` and `tasks`, each side used at most once.
    async fn suggest_assignment(&self, agvs: &[Agv], tasks: &[Task]) -> anyhow::Result<Vec<Pairing>>;
}
