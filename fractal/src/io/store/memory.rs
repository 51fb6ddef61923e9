//! In-memory store for tests. Clones share state, so a test can keep a handle
//! while the orchestrator owns another.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use anyhow::{Result, bail};

use super::StateStore;
use crate::task::{AttemptRecord, Task, TaskDraft, TaskStatus, now_rfc3339};

#[derive(Debug, Default)]
struct Inner {
    tasks: HashMap<String, Task>,
    attempts: HashMap<String, Vec<AttemptRecord>>,
    /// Every persisted status per task, in write order (consecutive duplicates collapsed).
    history: HashMap<String, Vec<TaskStatus>>,
    next_id: u32,
    fail_writes: bool,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Rc<RefCell<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Statuses `task_id` has been persisted with, oldest first.
    pub fn status_history(&self, task_id: &str) -> Vec<TaskStatus> {
        self.inner
            .borrow()
            .history
            .get(task_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Make every later task write fail.
    pub fn fail_writes(&self) {
        self.inner.borrow_mut().fail_writes = true;
    }

    /// Find a task by title.
    pub fn find(&self, title: &str) -> Option<Task> {
        self.inner
            .borrow()
            .tasks
            .values()
            .find(|task| task.title == title)
            .cloned()
    }

    fn write(&self, task: &Task) {
        let mut inner = self.inner.borrow_mut();
        let history = inner.history.entry(task.id.clone()).or_default();
        if history.last() != Some(&task.status) {
            history.push(task.status);
        }
        inner.tasks.insert(task.id.clone(), task.clone());
    }
}

impl StateStore for InMemoryStore {
    fn create_task(&self, draft: TaskDraft) -> Result<Task> {
        let id = {
            let mut inner = self.inner.borrow_mut();
            inner.next_id += 1;
            format!("task-{:04}", inner.next_id)
        };
        let task = draft.into_task(id, &now_rfc3339());
        self.write(&task);
        Ok(task)
    }

    fn put_task(&self, task: &Task) -> Result<()> {
        if self.inner.borrow().fail_writes {
            bail!("store unavailable");
        }
        self.write(task);
        Ok(())
    }

    fn get_task(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.inner.borrow().tasks.get(id).cloned())
    }

    fn load_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.inner.borrow().tasks.values().cloned().collect())
    }

    fn record_attempt(&self, record: &AttemptRecord) -> Result<()> {
        self.inner
            .borrow_mut()
            .attempts
            .entry(record.task_id.clone())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    fn attempts(&self, task_id: &str) -> Result<Vec<AttemptRecord>> {
        Ok(self
            .inner
            .borrow()
            .attempts
            .get(task_id)
            .cloned()
            .unwrap_or_default())
    }
}
