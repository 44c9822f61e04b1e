//! Rule-based observations about the current fleet snapshot.

use chrono::{DateTime, Utc};

use crate::{
    models::{AgvStatus, FleetSnapshot},
    schema::{Insight, InsightLevel, InsightsReport, MaintenancePrediction, MaintenanceUrgency},
};

const EFFICIENCY_FLOOR: f64 = 0.7;
const BATTERY_FLOOR: f64 = 50.0;
const CRITICAL_BATTERY: f64 = 20.0;

pub fn analyze(snapshot: &FleetSnapshot, now: DateTime<Utc>) -> InsightsReport {
    let metrics = &snapshot.metrics;
    let mut insights = Vec::new();

    if metrics.total_agvs > 0 && metrics.efficiency_ratio < EFFICIENCY_FLOOR {
        insights.push(Insight {
            level: InsightLevel::Warning,
            title: "Low fleet utilisation".to_string(),
            detail: format!(
                "{:.0}% of vehicles are moving or executing tasks",
                metrics.efficiency_ratio * 100.0
            ),
            recommendation: "Batch pending moves or stage idle vehicles near busy berths".to_string(),
        });
    }

    if metrics.total_agvs > 0 && metrics.average_battery < BATTERY_FLOOR {
        insights.push(Insight {
            level: InsightLevel::Warning,
            title: "Fleet battery is low".to_string(),
            detail: format!("Average battery is {:.1}%", metrics.average_battery),
            recommendation: "Stagger charging so capacity stays available".to_string(),
        });
    }

    if metrics.pending_tasks > metrics.idle_agvs {
        insights.push(Insight {
            level: InsightLevel::Info,
            title: "Task backlog exceeds idle capacity".to_string(),
            detail: format!(
                "{} pending tasks for {} idle vehicles",
                metrics.pending_tasks, metrics.idle_agvs
            ),
            recommendation: "Expect queueing delays; consider provisioning more vehicles".to_string(),
        });
    }

    if metrics.emergency_stopped_agvs > 0 {
        insights.push(Insight {
            level: InsightLevel::Critical,
            title: "Vehicles under emergency stop".to_string(),
            detail: format!("{} vehicle(s) are emergency stopped", metrics.emergency_stopped_agvs),
            recommendation: "Inspect and reset stopped vehicles".to_string(),
        });
    }

    let maintenance = snapshot
        .agvs
        .iter()
        .map(|agv| {
            let needs = agv.battery_level < BATTERY_FLOOR || agv.status == AgvStatus::Charging;
            let urgency = if agv.battery_level < CRITICAL_BATTERY {
                MaintenanceUrgency::High
            } else if needs {
                MaintenanceUrgency::Medium
            } else {
                MaintenanceUrgency::Low
            };
            let reason = if agv.status == AgvStatus::Charging {
                format!("charging at {:.1}%", agv.battery_level)
            } else if needs {
                format!("battery at {:.1}%", agv.battery_level)
            } else {
                "no action needed".to_string()
            };
            MaintenancePrediction {
                agv_id: agv.id.clone(),
                needs_maintenance: needs,
                urgency,
                reason,
            }
        })
        .collect();

    insights.sort_by(|a, b| b.level.cmp(&a.level));
    InsightsReport {
        generated_at: now,
        insights,
        maintenance,
    }
}
