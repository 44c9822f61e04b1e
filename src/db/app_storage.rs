use std::path::PathBuf;

use log::warn;
use sled::Db;

use crate::{
    db::FleetStore,
    error::AppResult,
    models::{Agv, Task},
};

/// sled-backed store with one tree per record type, values encoded with
/// `rmp_serde` named fields so records survive field reordering.
pub struct FleetStorage {
    db: Db,
    agvs: sled::Tree,
    tasks: sled::Tree,
}

impl FleetStorage {
    /// Open or create the store under `<base_path>/fleet`.
    pub fn open(base_path: &str) -> AppResult<Self> {
        let mut path = PathBuf::from(base_path);
        std::fs::create_dir_all(&path)?;
        path.push("fleet");
        Self::from_db(sled::open(path)?)
    }

    /// Throwaway store, removed when dropped.
    pub fn temporary() -> AppResult<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> AppResult<Self> {
        let agvs = db.open_tree("agvs")?;
        let tasks = db.open_tree("tasks")?;
        Ok(Self { db, agvs, tasks })
    }

    fn decode_all<T: serde::de::DeserializeOwned>(tree: &sled::Tree, what: &str) -> AppResult<Vec<T>> {
        let mut result = Vec::new();
        for item in tree.iter() {
            let (key, value) = item?;
            match rmp_serde::from_slice::<T>(&value) {
                Ok(record) => result.push(record),
                // One corrupt record must not hide the rest of the fleet
                Err(e) => warn!(
                    "Skipping unreadable {} record {}: {}",
                    what,
                    String::from_utf8_lossy(&key),
                    e
                ),
            }
        }
        Ok(result)
    }
}

impl FleetStore for FleetStorage {
    fn load_agvs(&self) -> AppResult<Vec<Agv>> {
        Self::decode_all(&self.agvs, "agv")
    }

    fn load_tasks(&self) -> AppResult<Vec<Task>> {
        Self::decode_all(&self.tasks, "task")
    }

    fn append_task(&self, task: &Task) -> AppResult<()> {
        let bytes = rmp_serde::to_vec_named(task)?;
        self.tasks.insert(task.id.as_bytes(), bytes)?;
        Ok(())
    }

    fn save_agv_state(&self, agv: &Agv) -> AppResult<()> {
        let bytes = rmp_serde::to_vec_named(agv)?;
        self.agvs.insert(agv.id.as_bytes(), bytes)?;
        Ok(())
    }

    fn remove_agv(&self, id: &str) -> AppResult<()> {
        self.agvs.remove(id.as_bytes())?;
        Ok(())
    }

    fn flush(&self) -> AppResult<()> {
        self.db.flush()?;
        Ok(())
    }
}
