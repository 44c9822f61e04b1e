use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;

use crate::{
    advisor::{Pairing, RouteAdvisor},
    config::{AgvConfig, YardConfig},
    models::{Agv, Position, Route, Task},
    schema::{CongestionLevel, CongestionZone},
};

/// Side of the square cells waypoints are counted in, in metres.
pub const CONGESTION_CELL: f64 = 50.0;
/// Cells with more waypoints than this are reported.
const CONGESTION_MIN_HITS: usize = 2;
/// Cells with more waypoints than this are reported as HIGH.
const CONGESTION_HIGH_HITS: usize = 4;
/// Expected wait per waypoint in a congested cell.
const DELAY_MINUTES_PER_HIT: f64 = 2.5;

/// Straight-line routes and nearest-neighbour pairing. Always answers.
#[derive(Clone, Debug, Default)]
pub struct LocalHeuristicAdvisor {
    agv: AgvConfig,
    yard: YardConfig,
}

impl LocalHeuristicAdvisor {
    pub fn new(agv: AgvConfig, yard: YardConfig) -> Self {
        Self { agv, yard }
    }

    /// Straight line split into legs no longer than the yard's maximum leg.
    pub fn straight_route(&self, origin: Position, destination: Position) -> Route {
        let distance = origin.distance_to(&destination);
        let legs = (distance / self.yard.max_route_leg).ceil().max(1.0) as usize;
        let mut waypoints = Vec::with_capacity(legs + 1);
        waypoints.push(origin);
        for i in 1..legs {
            let t = i as f64 / legs as f64;
            waypoints.push(Position::new(
                origin.x + (destination.x - origin.x) * t,
                origin.y + (destination.y - origin.y) * t,
            ));
        }
        waypoints.push(destination);
        Route::through(waypoints, &self.agv, Utc::now())
    }

    /// Count waypoints per grid cell over `routes` and report the crowded cells,
    /// busiest first.
    pub fn congestion_zones<'a>(&self, routes: impl IntoIterator<Item = &'a Route>) -> Vec<CongestionZone> {
        let mut density: BTreeMap<(i64, i64), usize> = BTreeMap::new();
        for waypoint in routes.into_iter().flat_map(|r| r.waypoints.iter()) {
            let cell = (
                (waypoint.x / CONGESTION_CELL).floor() as i64,
                (waypoint.y / CONGESTION_CELL).floor() as i64,
            );
            *density.entry(cell).or_default() += 1;
        }

        let mut zones: Vec<CongestionZone> = density
            .into_iter()
            .filter(|(_, count)| *count > CONGESTION_MIN_HITS)
            .map(|((cx, cy), count)| {
                let corner = Position::new(cx as f64 * CONGESTION_CELL, cy as f64 * CONGESTION_CELL);
                CongestionZone {
                    zone: format!("Grid_{},{}", corner.x, corner.y),
                    coordinates: corner,
                    waypoint_count: count,
                    level: if count > CONGESTION_HIGH_HITS {
                        CongestionLevel::High
                    } else {
                        CongestionLevel::Medium
                    },
                    estimated_delay_minutes: count as f64 * DELAY_MINUTES_PER_HIT,
                    recommendation: format!("Avoid cell with {count} planned waypoints"),
                }
            })
            .collect();
        zones.sort_by(|a, b| b.waypoint_count.cmp(&a.waypoint_count));
        zones
    }

    /// Each task, in the order given, takes the closest unused vehicle.
    pub fn nearest_pairs(&self, agvs: &[Agv], tasks: &[Task]) -> Vec<Pairing> {
        let mut used = vec![false; agvs.len()];
        let mut pairs = Vec::new();
        for task in tasks {
            let nearest = agvs
                .iter()
                .enumerate()
                .filter(|(i, _)| !used[*i])
                .min_by(|(_, a), (_, b)| {
                    a.position
                        .distance_to(&task.origin)
                        .total_cmp(&b.position.distance_to(&task.origin))
                        .then_with(|| a.id.cmp(&b.id))
                });
            let Some((index, agv)) = nearest else {
                break;
            };
            used[index] = true;
            pairs.push(Pairing {
                agv_id: agv.id.clone(),
                task_id: task.id.clone(),
            });
        }
        pairs
    }
}

#[async_trait]
impl RouteAdvisor for LocalHeuristicAdvisor {
    async fn suggest_route(
        &self,
        origin: Position,
        destination: Position,
        _obstacles: &[Position],
    ) -> anyhow::Result<Route> {
        Ok(self.straight_route(origin, destination))
    }

    async fn suggest_assignment(&self, agvs: &[Agv], tasks: &[Task]) -> anyhow::Result<Vec<Pairing>> {
        Ok(self.nearest_pairs(agvs, tasks))
    }
}
