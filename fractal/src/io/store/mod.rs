//! Durable task state with interchangeable backends.
//!
//! - `file`: one JSON file per task, replaced atomically
//! - `tracker`: an issue tracker CLI; each issue's notes hold the full record
//! - `memory`: non-persistent, for tests
//!
//! The orchestrator is the only writer and talks to the [`StateStore`] trait, so
//! it cannot tell which backend is active.

mod file;
mod memory;
mod tracker;

pub use file::FileStore;
pub use memory::InMemoryStore;
pub use tracker::{BdCli, TrackerClient, TrackerIssue, TrackerStore, tracker_status};

use anyhow::Result;

use crate::task::{AttemptRecord, Task, TaskDraft};

pub trait StateStore {
    /// Persist a new task and return it with its assigned id.
    fn create_task(&self, draft: TaskDraft) -> Result<Task>;

    /// Replace the stored record for `task.id`. Readers see the old or the new record, never a mix.
    fn put_task(&self, task: &Task) -> Result<()>;

    fn get_task(&self, id: &str) -> Result<Option<Task>>;

    /// Every task in the store, in no particular order.
    fn load_tasks(&self) -> Result<Vec<Task>>;

    fn record_attempt(&self, record: &AttemptRecord) -> Result<()>;

    /// Attempt history for a task, oldest first.
    fn attempts(&self, task_id: &str) -> Result<Vec<AttemptRecord>>;
}
