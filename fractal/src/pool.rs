//! Bounded worker pool.
//!
//! Admission is strict: a submission with no free slot or an unmet dependency is
//! rejected with a [`PoolError`]. The scheduler never attempts either, so a
//! rejection means a scheduling bug rather than back-pressure.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, warn};

use crate::core::error::PoolError;
use crate::io::worker::{
    WorkerBackend, WorkerHandle, WorkerOutcome, WorkerRecord, WorkerRequest, WorkerStatus,
    new_record,
};
use crate::task::TaskStatus;

struct RunningWorker {
    record: WorkerRecord,
    handle: Box<dyn WorkerHandle>,
    stall_warned: bool,
}

/// A worker that exited (or was cancelled), with its final record.
#[derive(Debug, Clone)]
pub struct FinishedWorker {
    pub record: WorkerRecord,
    pub outcome: WorkerOutcome,
}

pub struct WorkerPool {
    max_workers: usize,
    running: BTreeMap<String, RunningWorker>,
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers,
            running: BTreeMap::new(),
        }
    }

    pub fn free_slots(&self) -> usize {
        self.max_workers.saturating_sub(self.running.len())
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn is_running(&self, task_id: &str) -> bool {
        self.running.contains_key(task_id)
    }

    /// Start a worker for `request`.
    ///
    /// `depends_on` is checked against `statuses`: every dependency must be completed.
    pub fn submit(
        &mut self,
        backend: &dyn WorkerBackend,
        request: WorkerRequest,
        depends_on: &[String],
        statuses: &HashMap<String, TaskStatus>,
    ) -> Result<&WorkerRecord> {
        if self.free_slots() == 0 {
            return Err(PoolError::NoFreeSlots {
                max_workers: self.max_workers,
            }
            .into());
        }
        if self.running.contains_key(&request.task_id) {
            return Err(PoolError::AlreadyRunning(request.task_id).into());
        }
        let unmet: Vec<String> = depends_on
            .iter()
            .filter(|dep| statuses.get(*dep) != Some(&TaskStatus::Completed))
            .cloned()
            .collect();
        if !unmet.is_empty() {
            return Err(PoolError::UnmetDependencies {
                task_id: request.task_id,
                unmet,
            }
            .into());
        }

        let handle = backend.spawn(&request)?;
        let record = new_record(&request, handle.as_ref());
        debug!(task_id = %record.task_id, attempt = record.attempt, pid = ?record.pid, "worker admitted");
        let worker = self
            .running
            .entry(request.task_id)
            .or_insert(RunningWorker {
                record,
                handle,
                stall_warned: false,
            });
        Ok(&worker.record)
    }

    /// Collect every worker that has exited since the last poll. Never blocks.
    pub fn poll(&mut self) -> Vec<FinishedWorker> {
        let mut done = Vec::new();
        for (task_id, worker) in &mut self.running {
            match worker.handle.try_finish() {
                Ok(Some(outcome)) => done.push((task_id.clone(), outcome)),
                Ok(None) => {}
                Err(err) => {
                    warn!(task_id = %task_id, err = %err, "lost track of worker");
                    done.push((
                        task_id.clone(),
                        WorkerOutcome::Errored {
                            error: format!("worker supervision failed: {err:#}"),
                            metrics: Default::default(),
                        },
                    ));
                }
            }
        }
        done.into_iter()
            .filter_map(|(task_id, outcome)| self.retire(&task_id, outcome))
            .collect()
    }

    /// Cancel one running worker. Returns `None` if the task has no worker.
    pub fn cancel(
        &mut self,
        task_id: &str,
        grace: Duration,
        reason: &str,
    ) -> Option<FinishedWorker> {
        let worker = self.running.get_mut(task_id)?;
        let outcome = worker.handle.cancel(grace, reason).unwrap_or_else(|err| {
            warn!(task_id, err = %err, "cancel failed");
            WorkerOutcome::Errored {
                error: format!("{reason} (cancel failed: {err:#})"),
                metrics: Default::default(),
            }
        });
        self.retire(task_id, outcome)
    }

    pub fn cancel_all(&mut self, grace: Duration, reason: &str) -> Vec<FinishedWorker> {
        let ids: Vec<String> = self.running.keys().cloned().collect();
        ids.iter()
            .filter_map(|id| self.cancel(id, grace, reason))
            .collect()
    }

    /// Workers running longer than `threshold` that have not been reported yet.
    pub fn newly_stalled(&mut self, threshold: Duration) -> Vec<WorkerRecord> {
        let mut stalled = Vec::new();
        for worker in self.running.values_mut() {
            if !worker.stall_warned && worker.record.started.elapsed() >= threshold {
                worker.stall_warned = true;
                stalled.push(worker.record.clone());
            }
        }
        stalled
    }

    /// Tasks whose worker has run longer than `limit`.
    pub fn overdue(&self, limit: Duration) -> Vec<String> {
        self.running
            .values()
            .filter(|worker| worker.record.started.elapsed() >= limit)
            .map(|worker| worker.record.task_id.clone())
            .collect()
    }

    fn retire(&mut self, task_id: &str, outcome: WorkerOutcome) -> Option<FinishedWorker> {
        let mut worker = self.running.remove(task_id)?;
        worker.record.usage = outcome.metrics().tokens;
        worker.record.status = if outcome.succeeded() {
            WorkerStatus::Completed
        } else {
            WorkerStatus::Failed
        };
        Some(FinishedWorker {
            record: worker.record,
            outcome,
        })
    }
}
