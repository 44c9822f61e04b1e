//! Pure position and battery arithmetic for one simulation tick.

use std::collections::VecDeque;

use crate::{config::AgvConfig, models::Position};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Step {
    pub position: Position,
    pub traveled: f64,
    pub arrived: bool,
}

/// Move at most `budget` metres from `from` toward `target`. Never overshoots;
/// lands exactly on the target when it is within reach or within `epsilon`.
pub fn step_toward(from: Position, target: Position, budget: f64, epsilon: f64) -> Step {
    let distance = from.distance_to(&target);
    if distance <= epsilon || distance <= budget {
        return Step {
            position: target,
            traveled: distance,
            arrived: true,
        };
    }
    if budget <= 0.0 {
        return Step {
            position: from,
            traveled: 0.0,
            arrived: false,
        };
    }
    let ratio = budget / distance;
    Step {
        position: Position::new(
            from.x + (target.x - from.x) * ratio,
            from.y + (target.y - from.y) * ratio,
        ),
        traveled: budget,
        arrived: false,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PathProgress {
    pub position: Position,
    pub traveled: f64,
    /// Waypoints reached and popped from the path, in order.
    pub reached: Vec<Position>,
    pub remaining_budget: f64,
}

/// Consume waypoints from the front of `path`, carrying leftover distance
/// from one waypoint into the next.
pub fn follow_path(
    from: Position,
    path: &mut VecDeque<Position>,
    budget: f64,
    epsilon: f64,
) -> PathProgress {
    let mut position = from;
    let mut remaining = budget.max(0.0);
    let mut traveled = 0.0;
    let mut reached = Vec::new();

    while let Some(next) = path.front().copied() {
        let step = step_toward(position, next, remaining, epsilon);
        position = step.position;
        traveled += step.traveled;
        remaining = (remaining - step.traveled).max(0.0);
        if !step.arrived {
            break;
        }
        path.pop_front();
        reached.push(next);
    }

    PathProgress {
        position,
        traveled,
        reached,
        remaining_budget: remaining,
    }
}

/// Battery left after travelling `traveled` metres. Not clamped.
pub fn drain(battery: f64, traveled: f64, agv: &AgvConfig) -> f64 {
    battery - agv.energy_for(traveled)
}

/// Battery after `tick_seconds` on the charger, capped at 100.
pub fn charge(battery: f64, tick_seconds: f64, agv: &AgvConfig) -> f64 {
    (battery + agv.charging_rate_per_minute * tick_seconds / 60.0).min(100.0)
}

/// Metres a vehicle covers in one tick.
pub fn travel_budget(tick_seconds: f64, agv: &AgvConfig) -> f64 {
    agv.speed_m_per_s() * tick_seconds.max(0.0)
}
