//! Fire-and-forget event sink for alerts and lifecycle events.
//!
//! The fleet never depends on delivery: `emit` cannot fail, and the
//! default [`EventLog`] only writes to the log and keeps a bounded
//! in-memory history for the alert endpoints.

use std::{collections::VecDeque, sync::RwLock};

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::utils::time_sortable_uid;

const MAX_RECENT_EVENTS: usize = 100;
const MAX_RECENT_ALERTS: usize = 50;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    TaskEnqueued,
    TaskAssigned,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskCancelled,
    TaskInterrupted,
    EmergencyTaskCreated,
    AgvMoveCommanded,
    AgvProvisioned,
    AgvDecommissioned,
    MaintenanceChanged,
    EmergencyStop,
    EmergencyReset,
    LowBattery,
    Stalled,
    DeadlineWarning,
    AdvisorCall,
    PersistenceDegraded,
}

impl EventKind {
    pub fn severity(&self) -> Severity {
        match self {
            EventKind::EmergencyStop => Severity::Critical,
            EventKind::TaskFailed
            | EventKind::LowBattery
            | EventKind::EmergencyTaskCreated
            | EventKind::PersistenceDegraded => Severity::High,
            EventKind::TaskInterrupted
            | EventKind::DeadlineWarning
            | EventKind::AgvMoveCommanded => Severity::Medium,
            EventKind::Stalled => Severity::Low,
            _ => Severity::Info,
        }
    }

    /// Alerts are kept separately and can be acknowledged.
    pub fn is_alert(&self) -> bool {
        matches!(
            self,
            EventKind::EmergencyStop
                | EventKind::TaskFailed
                | EventKind::LowBattery
                | EventKind::Stalled
                | EventKind::DeadlineWarning
                | EventKind::EmergencyTaskCreated
                | EventKind::PersistenceDegraded
        )
    }
}

/// Receives structured events. Implementations must not block the caller
/// for long and must swallow their own failures.
pub trait Notifier: Send + Sync {
    fn emit(&self, kind: EventKind, payload: Value);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub id: String,
    pub kind: EventKind,
    pub severity: Severity,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    pub acknowledged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct EventLogState {
    events: VecDeque<EventRecord>,
    alerts: VecDeque<EventRecord>,
}

/// Logs every event and remembers the most recent ones.
#[derive(Default)]
pub struct EventLog {
    state: RwLock<EventLogState>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recent_events(&self, limit: usize) -> Vec<EventRecord> {
        match self.state.read() {
            Ok(state) => tail(&state.events, limit),
            Err(_) => Vec::new(),
        }
    }

    pub fn recent_alerts(&self, limit: usize) -> Vec<EventRecord> {
        match self.state.read() {
            Ok(state) => tail(&state.alerts, limit),
            Err(_) => Vec::new(),
        }
    }

    pub fn unacknowledged_alerts(&self) -> Vec<EventRecord> {
        match self.state.read() {
            Ok(state) => state
                .alerts
                .iter()
                .filter(|alert| !alert.acknowledged)
                .cloned()
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Returns false when no retained alert has that id.
    pub fn acknowledge(&self, alert_id: &str) -> bool {
        let Ok(mut state) = self.state.write() else {
            return false;
        };
        match state.alerts.iter_mut().find(|alert| alert.id == alert_id) {
            Some(alert) => {
                alert.acknowledged = true;
                alert.acknowledged_at = Some(Utc::now());
                info!("Alert {} acknowledged", alert_id);
                true
            }
            None => false,
        }
    }

    /// Events of one kind, oldest first.
    pub fn events_of(&self, kind: EventKind) -> Vec<EventRecord> {
        match self.state.read() {
            Ok(state) => state
                .events
                .iter()
                .filter(|event| event.kind == kind)
                .cloned()
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

fn tail(records: &VecDeque<EventRecord>, limit: usize) -> Vec<EventRecord> {
    let skip = records.len().saturating_sub(limit);
    records.iter().skip(skip).cloned().collect()
}

impl Notifier for EventLog {
    fn emit(&self, kind: EventKind, payload: Value) {
        let severity = kind.severity();
        match severity {
            Severity::Critical | Severity::High => error!("[{:?}] {}", kind, payload),
            Severity::Medium => warn!("[{:?}] {}", kind, payload),
            _ => info!("[{:?}] {}", kind, payload),
        }

        let record = EventRecord {
            id: time_sortable_uid(),
            kind,
            severity,
            payload,
            timestamp: Utc::now(),
            acknowledged: false,
            acknowledged_at: None,
        };

        let Ok(mut state) = self.state.write() else {
            return;
        };
        if kind.is_alert() {
            state.alerts.push_back(record.clone());
            if state.alerts.len() > MAX_RECENT_ALERTS {
                state.alerts.pop_front();
            }
        }
        state.events.push_back(record);
        if state.events.len() > MAX_RECENT_EVENTS {
            state.events.pop_front();
        }
    }
}
