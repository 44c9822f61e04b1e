use crate::{
    error::AppResult,
    models::{Agv, Task},
};

pub mod app_storage;
pub mod roster;

/// Durable home of AGV and task records.
///
/// Every call is synchronous from the fleet's point of view. Failures are
/// logged by the caller and the fleet keeps running on its in-memory state.
pub trait FleetStore: Send + Sync {
    fn load_agvs(&self) -> AppResult<Vec<Agv>>;

    fn load_tasks(&self) -> AppResult<Vec<Task>>;

    /// Insert a task record; writing the same id again replaces it.
    fn append_task(&self, task: &Task) -> AppResult<()>;

    fn save_agv_state(&self, agv: &Agv) -> AppResult<()>;

    fn save_task_state(&self, task: &Task) -> AppResult<()> {
        self.append_task(task)
    }

    fn remove_agv(&self, id: &str) -> AppResult<()>;

    fn flush(&self) -> AppResult<()> {
        Ok(())
    }
}
