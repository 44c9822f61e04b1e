//! Emergency-stop latch and the per-tick alert inspection.

use std::{
    collections::HashSet,
    sync::{Arc, RwLock},
};

use chrono::{DateTime, Utc};
use log::warn;
use serde_json::json;

use crate::{
    config::AlertConfig,
    models::{Agv, AgvStatus, Task},
    notify::{EventKind, Notifier},
};

/// Vehicles under an emergency stop, shared outside the engine lock so a stop
/// request takes effect before it gets its turn at the engine.
#[derive(Clone, Default)]
pub struct EmergencyLatch {
    inner: Arc<RwLock<HashSet<String>>>,
}

impl EmergencyLatch {
    pub fn engage(&self, agv_id: &str) {
        match self.inner.write() {
            Ok(mut set) => {
                set.insert(agv_id.to_string());
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(agv_id.to_string());
            }
        }
    }

    pub fn release(&self, agv_id: &str) {
        match self.inner.write() {
            Ok(mut set) => {
                set.remove(agv_id);
            }
            Err(poisoned) => {
                poisoned.into_inner().remove(agv_id);
            }
        }
    }

    pub fn is_engaged(&self, agv_id: &str) -> bool {
        match self.inner.read() {
            Ok(set) => set.contains(agv_id),
            Err(poisoned) => poisoned.into_inner().contains(agv_id),
        }
    }
}

/// Remembers which conditions were already reported so each one is raised
/// once per episode.
#[derive(Default)]
pub struct AlertController {
    config: AlertConfig,
    low_battery: HashSet<String>,
    stalled: HashSet<String>,
    deadline_warned: HashSet<String>,
}

impl AlertController {
    pub fn new(config: AlertConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// Evaluate thresholds and emit new alerts. Returns how many were raised.
    pub fn inspect<'a>(
        &mut self,
        agvs: impl IntoIterator<Item = &'a Agv>,
        tasks: impl IntoIterator<Item = &'a Task>,
        notifier: &dyn Notifier,
        now: DateTime<Utc>,
    ) -> usize {
        let mut raised = 0;

        for agv in agvs {
            if agv.battery_level < self.config.low_battery_threshold {
                if self.low_battery.insert(agv.id.clone()) {
                    notifier.emit(
                        EventKind::LowBattery,
                        json!({
                            "agvId": agv.id,
                            "batteryLevel": agv.battery_level,
                            "threshold": self.config.low_battery_threshold,
                            "status": agv.status,
                        }),
                    );
                    raised += 1;
                }
            } else {
                self.low_battery.remove(&agv.id);
            }

            let watch_for_stall = matches!(
                agv.status,
                AgvStatus::Idle | AgvStatus::Moving | AgvStatus::ExecutingTask
            );
            let quiet_for = now - agv.last_activity;
            if watch_for_stall && quiet_for >= self.config.stall_duration {
                if self.stalled.insert(agv.id.clone()) {
                    notifier.emit(
                        EventKind::Stalled,
                        json!({
                            "agvId": agv.id,
                            "status": agv.status,
                            "idleMinutes": quiet_for.num_minutes(),
                        }),
                    );
                    raised += 1;
                }
            } else {
                // Activity or a status outside the watched set ends the episode
                self.stalled.remove(&agv.id);
            }
        }

        for task in tasks {
            if !task.is_open() {
                self.deadline_warned.remove(&task.id);
                continue;
            }
            let remaining = task.deadline - now;
            if remaining <= self.config.deadline_warning_window && self.deadline_warned.insert(task.id.clone()) {
                notifier.emit(
                    EventKind::DeadlineWarning,
                    json!({
                        "taskId": task.id,
                        "status": task.status,
                        "assignedAgvId": task.assigned_agv_id,
                        "deadline": task.deadline,
                        "minutesLeft": remaining.num_minutes(),
                    }),
                );
                raised += 1;
            }
        }

        raised
    }

    /// Drop bookkeeping for a vehicle that left the fleet.
    pub fn forget_agv(&mut self, agv_id: &str) {
        self.low_battery.remove(agv_id);
        self.stalled.remove(agv_id);
    }
}

/// Latch the vehicle, halt it in place and emit the critical alert. A vehicle
/// that is already stopped only gets the alert again.
pub fn engage_stop(agv: &mut Agv, latch: &EmergencyLatch, notifier: &dyn Notifier, released_task: Option<&str>, now: DateTime<Utc>) {
    latch.engage(&agv.id);
    let already = agv.status == AgvStatus::EmergencyStopped;
    if !already {
        agv.engage_emergency_stop(now);
        warn!("Emergency stop engaged on {}", agv.id);
    }
    notifier.emit(
        EventKind::EmergencyStop,
        json!({
            "agvId": agv.id,
            "position": agv.position,
            "batteryLevel": agv.battery_level,
            "releasedTaskId": released_task,
            "repeated": already,
        }),
    );
}
