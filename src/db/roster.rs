//! Initial fleet roster, used when the store holds no vehicles yet.

use std::path::Path;

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};

use crate::{
    db::FleetStore,
    error::{AppError, AppResult},
    models::{Agv, Position},
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct RosterEntry {
    pub id: String,
    pub name: String,
    pub x: f64,
    pub y: f64,
    #[serde(default = "full_battery")]
    pub battery: f64,
}

fn full_battery() -> f64 {
    100.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RosterFile {
    agvs: Vec<RosterEntry>,
}

/// Reads a YAML file of the form `agvs: [{id, name, x, y, battery}]`.
pub fn load_roster(path: impl AsRef<Path>) -> AppResult<Vec<RosterEntry>> {
    let raw = std::fs::read_to_string(path)?;
    parse_roster(&raw)
}

pub fn parse_roster(raw: &str) -> AppResult<Vec<RosterEntry>> {
    let file: RosterFile = serde_yaml::from_str(raw)?;
    let mut seen = std::collections::HashSet::new();
    for entry in &file.agvs {
        if !seen.insert(entry.id.as_str()) {
            return Err(AppError::validation(format!("duplicate roster id {}", entry.id)));
        }
        if !Position::new(entry.x, entry.y).is_finite() || !entry.battery.is_finite() {
            return Err(AppError::validation(format!("non-finite values for {}", entry.id)));
        }
    }
    Ok(file.agvs)
}

/// The six vehicles the yard starts with.
pub fn default_roster() -> Vec<RosterEntry> {
    [
        ("AGV-001", "Alfa Prime", 100.0, 50.0, 85.5),
        ("AGV-002", "Beta Runner", 250.0, 120.0, 92.0),
        ("AGV-003", "Gamma Loader", 180.0, 200.0, 67.3),
        ("AGV-004", "Delta Force", 320.0, 80.0, 15.8),
        ("AGV-005", "Echo Navigator", 75.0, 300.0, 88.2),
        ("AGV-006", "Foxtrot Express", 400.0, 150.0, 73.9),
    ]
    .into_iter()
    .map(|(id, name, x, y, battery)| RosterEntry {
        id: id.to_string(),
        name: name.to_string(),
        x,
        y,
        battery,
    })
    .collect()
}

impl RosterEntry {
    pub fn into_agv(self, charging_threshold: f64, now: DateTime<Utc>) -> Agv {
        let mut agv = Agv::new(self.id, self.name, Position::new(self.x, self.y), self.battery, now);
        // Vehicles that come up drained go straight to the chargers
        agv.set_battery(self.battery, charging_threshold, now);
        agv
    }
}

/// Writes the roster into an empty store. Returns how many vehicles were added.
pub fn seed_if_empty(
    store: &dyn FleetStore,
    roster_path: Option<&str>,
    charging_threshold: f64,
) -> AppResult<usize> {
    if !store.load_agvs()?.is_empty() {
        return Ok(0);
    }
    let entries = match roster_path {
        Some(path) => load_roster(path)?,
        None => default_roster(),
    };
    let now = Utc::now();
    let count = entries.len();
    for entry in entries {
        store.save_agv_state(&entry.into_agv(charging_threshold, now))?;
    }
    store.flush()?;
    info!("Seeded fleet store with {} vehicles", count);
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db::app_storage::FleetStorage, models::AgvStatus};

    #[test]
    fn parses_yaml_roster() {
        let raw = r#"
agvs:
  - id: AGV-100
    name: North Shuttle
    x: 12.5
    y: 40
  - id: AGV-101
    name: South Shuttle
    x: 300
    y: 80
    battery: 55.0
"#;
        let roster = parse_roster(raw).unwrap();
        assert_eq!(roster.len(), 2);
        assert_eq!(roster[0].battery, 100.0);
        assert_eq!(roster[1].battery, 55.0);
    }

    #[test]
    fn rejects_duplicate_ids() {
        let raw = "agvs:\n  - {id: A, name: a, x: 1, y: 1}\n  - {id: A, name: b, x: 2, y: 2}\n";
        assert!(matches!(parse_roster(raw), Err(AppError::Validation(_))));
    }

    #[test]
    fn seeds_only_once() {
        let store = FleetStorage::temporary().unwrap();
        assert_eq!(seed_if_empty(&store, None, 20.0).unwrap(), 6);
        assert_eq!(seed_if_empty(&store, None, 20.0).unwrap(), 0);

        let agvs = store.load_agvs().unwrap();
        let delta = agvs.iter().find(|a| a.id == "AGV-004").unwrap();
        assert_eq!(delta.status, AgvStatus::Charging);
    }
}
