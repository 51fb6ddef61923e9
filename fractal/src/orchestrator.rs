//! The orchestration state machine.
//!
//! [`Orchestrator`] owns the task graph, the worker pool and the only handle to
//! the state store. Planning happens up front (and again for any task left
//! unplanned by a crash); execution is a cooperative loop of [`Orchestrator::tick`]
//! calls, each of which:
//!
//! 1. collects finished workers and folds their outcome into the task
//!    (validate, retry, escalate),
//! 2. recomputes grouping tasks from their children,
//! 3. starts workers for queued retries and ready leaves up to free capacity,
//! 4. reports whether anything is left to do.
//!
//! All store writes happen on the thread calling `tick`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, info, instrument, warn};

use crate::agents::{PlanRequest, Strategies};
use crate::core::error::{PoolError, StructuralError};
use crate::core::graph::TaskGraph;
use crate::core::metrics::Metrics;
use crate::core::retry::{
    EscalationOutcome, FailureOutcome, apply_escalation, record_failure, resolve_human,
};
use crate::core::rollup::apply_rollups;
use crate::core::split::resolve_split;
use crate::core::types::{
    EscalationAction, EscalationDecision, PlanDecision, PlannedChild, WorkerResult,
};
use crate::io::config::FractalConfig;
use crate::io::platform;
use crate::io::prompt::{PromptEngine, WorkerPromptInput};
use crate::io::store::StateStore;
use crate::io::worker::{WorkerBackend, WorkerOutcome, WorkerRecord, WorkerRequest};
use crate::pool::{FinishedWorker, WorkerPool};
use crate::task::{AttemptRecord, Task, TaskDraft, TaskSize, TaskStatus, now_rfc3339};

const CANCELLED: &str = "cancelled";
const ORCHESTRATOR_ERROR: &str = "orchestrator error";
const WORKER_LOST: &str = "worker lost: orchestrator stopped while the attempt was running";

/// Limits the state machine enforces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub max_depth: u32,
    pub max_attempts: u32,
    pub max_workers: usize,
    pub max_escalations: u32,
    pub cancel_grace: Duration,
    pub stall_warning: Duration,
    pub attempt_timeout: Option<Duration>,
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_config(&FractalConfig::default())
    }
}

impl Settings {
    pub fn from_config(config: &FractalConfig) -> Self {
        Self {
            max_depth: config.max_depth,
            max_attempts: config.max_attempts,
            max_workers: config.max_workers,
            max_escalations: config.max_escalations,
            cancel_grace: config.cancel_grace(),
            stall_warning: Duration::from_secs(config.stall_warning_secs),
            attempt_timeout: config.attempt_timeout_secs.map(Duration::from_secs),
        }
    }
}

/// What one `process` call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanReport {
    /// Tasks that received a planner decision, in planning order.
    pub planned: Vec<String>,
    pub splits: usize,
    pub leaves: usize,
    /// Structural defects found below the entry task. Each marked its task failed.
    pub defects: Vec<StructuralError>,
    /// Planning stopped early on an interrupt; the rest stays unplanned for `recover`.
    pub interrupted: bool,
}

/// What one `tick` did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub finished: usize,
    pub dispatched: usize,
    pub running: usize,
    /// Nothing running, queued, or ready: further ticks would do nothing.
    pub idle: bool,
    pub interrupted: bool,
}

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStop {
    /// The root task completed.
    Complete,
    /// At least one task waits on a human.
    NeedsHuman,
    /// Work remains that cannot progress (fatal failures or blocked dependencies).
    Incomplete,
    /// Stopped by an interrupt; resumable.
    Interrupted,
}

/// Aggregate view of a run, also used by `fractal status`.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub root_id: String,
    pub root_status: Option<TaskStatus>,
    /// Leaf count per status.
    pub leaves: HashMap<TaskStatus, usize>,
    pub needs_human: Vec<String>,
    pub failed: Vec<String>,
    pub metrics: Metrics,
}

impl RunSummary {
    /// Summarize the tree under `root_id`. Tasks outside that tree are ignored.
    pub fn from_tasks<'a>(root_id: &str, tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let by_id: HashMap<&str, &Task> = tasks
            .into_iter()
            .map(|task| (task.id.as_str(), task))
            .collect();
        let mut summary = Self {
            root_id: root_id.to_string(),
            root_status: None,
            leaves: HashMap::new(),
            needs_human: Vec::new(),
            failed: Vec::new(),
            metrics: Metrics::default(),
        };
        let mut seen = HashSet::new();
        let mut stack = vec![root_id];
        while let Some(id) = stack.pop() {
            let Some(task) = by_id.get(id) else {
                continue;
            };
            if !seen.insert(id) {
                continue;
            }
            if task.id == root_id {
                summary.root_status = Some(task.status);
            }
            if task.is_grouping() {
                stack.extend(task.children.iter().rev().map(String::as_str));
                continue;
            }
            *summary.leaves.entry(task.status).or_default() += 1;
            summary.metrics += task.metrics;
            match task.status {
                TaskStatus::NeedsHuman => summary.needs_human.push(task.id.clone()),
                TaskStatus::Failed if !task.is_retryable() => summary.failed.push(task.id.clone()),
                _ => {}
            }
        }
        summary
    }

    pub fn stop(&self) -> RunStop {
        if self.root_status == Some(TaskStatus::Completed) {
            RunStop::Complete
        } else if !self.needs_human.is_empty() {
            RunStop::NeedsHuman
        } else {
            RunStop::Incomplete
        }
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.leaves.get(&status).copied().unwrap_or(0)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let root = self.root_status.map_or("missing", TaskStatus::as_str);
        writeln!(f, "root {}: {root}", self.root_id)?;
        for status in [
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Escalated,
            TaskStatus::NeedsHuman,
        ] {
            let count = self.count(status);
            if count > 0 {
                writeln!(f, "  {status}: {count}")?;
            }
        }
        writeln!(
            f,
            "tokens: {} in / {} out, cost ${:.4}",
            self.metrics.tokens.input_tokens, self.metrics.tokens.output_tokens, self.metrics.cost_usd
        )?;
        for id in &self.needs_human {
            writeln!(f, "needs human: {id}")?;
        }
        for id in &self.failed {
            writeln!(f, "failed: {id}")?;
        }
        Ok(())
    }
}

pub struct Orchestrator {
    store: Box<dyn StateStore>,
    strategies: Strategies,
    backend: Box<dyn WorkerBackend>,
    prompts: PromptEngine,
    settings: Settings,
    /// Mirror of the store; written through on every change.
    tasks: HashMap<String, Task>,
    graph: TaskGraph,
    pool: WorkerPool,
    /// Leaves owed another attempt (retries and fixer rounds), oldest first.
    retry_queue: VecDeque<String>,
    /// Leaves with a live worker. Excluded from dispatch.
    dispatched: HashSet<String>,
    root_id: Option<String>,
    interrupted: Box<dyn Fn() -> bool>,
}

impl Orchestrator {
    pub fn new(
        store: Box<dyn StateStore>,
        strategies: Strategies,
        backend: Box<dyn WorkerBackend>,
        settings: Settings,
    ) -> Self {
        Self {
            store,
            strategies,
            backend,
            prompts: PromptEngine::new(),
            pool: WorkerPool::new(settings.max_workers),
            settings,
            tasks: HashMap::new(),
            graph: TaskGraph::new(),
            retry_queue: VecDeque::new(),
            dispatched: HashSet::new(),
            root_id: None,
            interrupted: Box::new(platform::interrupted),
        }
    }

    /// Replace the interrupt check (the process-wide signal flag by default).
    pub fn with_interrupt_check(mut self, check: impl Fn() -> bool + 'static) -> Self {
        self.interrupted = Box::new(check);
        self
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn running(&self) -> usize {
        self.pool.running_count()
    }

    /// Create the root task and plan it.
    #[instrument(skip_all, fields(title = %title))]
    pub fn submit_root(&mut self, title: &str, description: &str) -> Result<String> {
        let root_id = self.create_root(title, description)?;
        self.plan_root()?;
        Ok(root_id)
    }

    /// Create the root task without planning it. Callers persist the run's
    /// identity before the planning pass, so a crash mid-planning can resume.
    pub fn create_root(&mut self, title: &str, description: &str) -> Result<String> {
        let root = self
            .store
            .create_task(TaskDraft {
                parent_id: None,
                title: title.to_string(),
                description: description.to_string(),
                size: None,
                max_attempts: self.settings.max_attempts,
                depends_on: Vec::new(),
            })
            .context("create root task")?;
        let root_id = root.id.clone();
        info!(task_id = %root_id, "root task submitted");
        self.graph.add_node(&root_id);
        self.tasks.insert(root_id.clone(), root);
        self.root_id = Some(root_id.clone());
        Ok(root_id)
    }

    /// Run the planning pass from the root created by [`Orchestrator::create_root`].
    pub fn plan_root(&mut self) -> Result<PlanReport> {
        let root_id = self
            .root_id
            .clone()
            .ok_or_else(|| anyhow!("no root task to plan"))?;
        let report = self.process(&root_id, 0)?;
        info!(
            splits = report.splits,
            leaves = report.leaves,
            defects = report.defects.len(),
            interrupted = report.interrupted,
            "planning finished"
        );
        Ok(report)
    }

    /// Plan `task_id` and, recursively, every child a split creates.
    ///
    /// An entry task deeper than `max_depth` is marked failed and the
    /// [`StructuralError::DepthExceeded`] returned. Defects found further down mark
    /// their own task failed and are collected in the report.
    #[instrument(skip_all, fields(task_id = %task_id, depth))]
    pub fn process(&mut self, task_id: &str, depth: u32) -> Result<PlanReport> {
        if depth > self.settings.max_depth {
            let defect = StructuralError::DepthExceeded {
                task_id: task_id.to_string(),
                depth,
                max_depth: self.settings.max_depth,
            };
            self.fail_structural(task_id, &defect)?;
            return Err(defect.into());
        }

        let mut report = PlanReport::default();
        let mut stack = vec![(task_id.to_string(), depth)];
        while let Some((id, depth)) = stack.pop() {
            if (self.interrupted)() {
                warn!(unplanned = stack.len() + 1, "planning interrupted");
                report.interrupted = true;
                break;
            }
            if depth > self.settings.max_depth {
                let defect = StructuralError::DepthExceeded {
                    task_id: id.clone(),
                    depth,
                    max_depth: self.settings.max_depth,
                };
                self.fail_structural(&id, &defect)?;
                report.defects.push(defect);
                continue;
            }
            let children = match self.plan_one(&id, depth) {
                Ok(children) => children,
                Err(defect) => {
                    self.fail_structural(&id, &defect)?;
                    report.defects.push(defect);
                    continue;
                }
            };
            report.planned.push(id);
            match children {
                Some(children) => {
                    report.splits += 1;
                    stack.extend(children.into_iter().rev().map(|child| (child, depth + 1)));
                }
                None => report.leaves += 1,
            }
        }
        Ok(report)
    }

    /// Ask the planner about one task and apply the answer.
    ///
    /// Returns the new children on a split, `None` for a leaf. Any failure, including a
    /// store write, comes back as a defect for this task.
    fn plan_one(
        &mut self,
        id: &str,
        depth: u32,
    ) -> std::result::Result<Option<Vec<String>>, StructuralError> {
        let task = self.tasks.get(id).cloned().ok_or_else(|| StructuralError::PlannerFailed {
            task_id: id.to_string(),
            message: "task is not loaded".to_string(),
        })?;
        let ancestors = self.ancestors(&task);
        let decision = self
            .strategies
            .planner
            .plan(&PlanRequest {
                task: &task,
                ancestors: &ancestors,
                depth,
                max_depth: self.settings.max_depth,
            })
            .map_err(|err| StructuralError::PlannerFailed {
                task_id: id.to_string(),
                message: format!("{err:#}"),
            })?;

        let (size, children) = match decision {
            PlanDecision::Split { size, children } if !children.is_empty() => (size, children),
            PlanDecision::Split { size, .. } => {
                warn!(task_id = %id, "planner split into zero children; executing instead");
                (size, Vec::new())
            }
            PlanDecision::Execute { size } => (size, Vec::new()),
        };

        if children.is_empty() {
            let mut task = task;
            task.size = size;
            task.planned = true;
            self.save(task).map_err(|err| StructuralError::PlannerFailed {
                task_id: id.to_string(),
                message: format!("{err:#}"),
            })?;
            debug!(task_id = %id, depth, "leaf planned");
            return Ok(None);
        }

        self.apply_split(task, size, &children)
            .map(Some)
            .or_else(|err| match err.downcast::<StructuralError>() {
                Ok(defect) => Err(defect),
                Err(err) => Err(StructuralError::PlannerFailed {
                    task_id: id.to_string(),
                    message: format!("{err:#}"),
                }),
            })
    }

    fn apply_split(
        &mut self,
        mut parent: Task,
        size: Option<TaskSize>,
        children: &[PlannedChild],
    ) -> Result<Vec<String>> {
        let resolved = resolve_split(&parent.id, children)?;

        let mut created = Vec::with_capacity(children.len());
        for child in children {
            let task = self
                .store
                .create_task(TaskDraft {
                    parent_id: Some(parent.id.clone()),
                    title: child.title.trim().to_string(),
                    description: child.description.clone(),
                    size: child.size,
                    max_attempts: self.settings.max_attempts,
                    depends_on: parent.depends_on.clone(),
                })
                .with_context(|| format!("create child of {}", parent.id))?;
            self.graph.add_node(&task.id);
            created.push(task);
        }

        let ids: Vec<String> = created.iter().map(|task| task.id.clone()).collect();
        let sibling_deps = resolved.real_dependencies(&ids);
        for (mut task, siblings) in created.into_iter().zip(sibling_deps) {
            for dep in siblings {
                if !task.depends_on.contains(&dep) {
                    task.depends_on.push(dep);
                }
            }
            for dep in &task.depends_on {
                self.graph
                    .add_edge(&task.id, dep)
                    .with_context(|| format!("link {} to {dep}", task.id))?;
            }
            self.save(task)?;
        }

        parent.size = size;
        parent.planned = true;
        parent.children = ids.clone();
        parent.transition(TaskStatus::InProgress)?;
        info!(task_id = %parent.id, children = ids.len(), "task split");
        self.save(parent)?;
        Ok(ids)
    }

    /// One pass of the control loop. Never blocks on a worker.
    #[instrument(skip_all)]
    pub fn tick(&mut self) -> Result<TickReport> {
        let mut report = TickReport::default();
        if (self.interrupted)() {
            self.shutdown(CANCELLED)?;
            report.interrupted = true;
            return Ok(report);
        }

        let finished = self.pool.poll();
        report.finished = finished.len();
        for worker in finished {
            self.handle_finished(worker)?;
        }
        if let Some(limit) = self.settings.attempt_timeout {
            for task_id in self.pool.overdue(limit) {
                let reason = format!("attempt timed out after {}s", limit.as_secs());
                warn!(task_id = %task_id, "cancelling overdue worker");
                if let Some(worker) = self.pool.cancel(&task_id, self.settings.cancel_grace, &reason)
                {
                    report.finished += 1;
                    self.handle_finished(worker)?;
                }
            }
        }
        for record in self.pool.newly_stalled(self.settings.stall_warning) {
            warn!(
                task_id = %record.task_id,
                attempt = record.attempt,
                pid = ?record.pid,
                running_secs = record.started.elapsed().as_secs(),
                "worker still running"
            );
        }

        self.apply_rollups()?;
        report.dispatched = self.dispatch_ready()?;
        report.running = self.pool.running_count();
        report.idle = report.running == 0 && report.dispatched == 0 && self.retry_queue.is_empty();
        Ok(report)
    }

    /// Tick until idle or interrupted, sleeping `check_interval` between ticks.
    ///
    /// An error out of a tick cancels every running worker before it is returned.
    pub fn run(&mut self, check_interval: Duration) -> Result<RunStop> {
        loop {
            let tick = match self.tick() {
                Ok(tick) => tick,
                Err(err) => {
                    let cancelled = self
                        .pool
                        .cancel_all(self.settings.cancel_grace, ORCHESTRATOR_ERROR);
                    if !cancelled.is_empty() {
                        error!(
                            workers = cancelled.len(),
                            err = %format!("{err:#}"),
                            "cancelled running workers after an error"
                        );
                    }
                    return Err(err);
                }
            };
            if tick.interrupted {
                info!("run interrupted");
                return Ok(RunStop::Interrupted);
            }
            if tick.idle {
                let stop = self.summary().stop();
                info!(stop = ?stop, "run finished");
                return Ok(stop);
            }
            if tick.finished == 0 {
                thread::sleep(check_interval);
            }
        }
    }

    /// Cancel a running attempt. The attempt counts as failed with reason `cancelled`.
    pub fn cancel(&mut self, task_id: &str) -> Result<bool> {
        let Some(worker) = self.pool.cancel(task_id, self.settings.cancel_grace, CANCELLED) else {
            return Ok(false);
        };
        self.handle_finished(worker)?;
        Ok(true)
    }

    /// Feed human input to a task waiting on one and put it back in the queue.
    #[instrument(skip_all, fields(task_id = %task_id))]
    pub fn resolve_human(&mut self, task_id: &str, note: &str) -> Result<()> {
        let mut task = self.load(task_id)?;
        resolve_human(&mut task, note)?;
        info!("human input recorded; task re-queued");
        self.save(task)?;
        self.apply_rollups()
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary::from_tasks(self.root_id.as_deref().unwrap_or_default(), self.tasks.values())
    }

    /// Rebuild in-memory state from the store after a restart.
    ///
    /// Leaves caught mid-attempt get a failed attempt, failed leaves are re-queued or
    /// re-escalated, and tasks the planner never answered for are planned again.
    #[instrument(skip_all, fields(root_id = %root_id))]
    pub fn recover(&mut self, root_id: &str) -> Result<()> {
        let loaded = self.store.load_tasks().context("load tasks")?;
        self.tasks = loaded.into_iter().map(|task| (task.id.clone(), task)).collect();
        if !self.tasks.contains_key(root_id) {
            return Err(anyhow!("root task {root_id} not found in store"));
        }
        self.root_id = Some(root_id.to_string());

        let order = self.preorder(root_id);
        if order.len() < self.tasks.len() {
            debug!(
                ignored = self.tasks.len() - order.len(),
                "store holds tasks outside this run"
            );
            let reachable: HashSet<&String> = order.iter().collect();
            self.tasks.retain(|id, _| reachable.contains(id));
        }

        let run_tasks: Vec<&Task> = order.iter().filter_map(|id| self.tasks.get(id)).collect();
        self.graph = TaskGraph::from_tasks(run_tasks).context("rebuild dependency graph")?;

        let mut unplanned = Vec::new();
        for id in &order {
            let task = self.tasks[id].clone();
            if !task.planned {
                if task.status == TaskStatus::Pending {
                    unplanned.push(id.clone());
                }
                continue;
            }
            if task.is_grouping() {
                continue;
            }
            match task.status {
                TaskStatus::InProgress => {
                    warn!(task_id = %id, "attempt was interrupted by a restart");
                    let now = now_rfc3339();
                    self.fail_attempt(task, WORKER_LOST, Metrics::default(), &now, None)?;
                }
                TaskStatus::Failed if !task.fatal => {
                    if task.is_retryable() {
                        self.retry_queue.push_back(id.clone());
                    } else {
                        self.escalate(id)?;
                    }
                }
                TaskStatus::Escalated => {
                    if task.attempts < task.max_attempts {
                        self.retry_queue.push_back(id.clone());
                    } else {
                        self.escalate(id)?;
                    }
                }
                _ => {}
            }
        }

        for id in unplanned {
            let depth = self.ancestors(&self.tasks[&id]).len() as u32;
            match self.process(&id, depth) {
                Ok(report) => debug!(task_id = %id, planned = report.planned.len(), "replanned"),
                Err(err) if err.downcast_ref::<StructuralError>().is_some() => {
                    error!(task_id = %id, err = %err, "cannot replan task");
                }
                Err(err) => return Err(err),
            }
        }
        self.apply_rollups()?;
        info!(
            tasks = self.tasks.len(),
            queued = self.retry_queue.len(),
            "state recovered"
        );
        Ok(())
    }

    fn dispatch_ready(&mut self) -> Result<usize> {
        let mut candidates: Vec<String> = Vec::new();
        while let Some(id) = self.retry_queue.pop_front() {
            candidates.push(id);
        }
        let statuses = self.statuses();
        let retries = candidates.len();
        candidates.extend(
            self.graph
                .ready(&statuses, &self.dispatched)
                .into_iter()
                .filter(|id| self.tasks.get(id).is_some_and(Task::is_leaf)),
        );

        let mut started = 0;
        for (index, id) in candidates.iter().enumerate() {
            if self.pool.free_slots() == 0 {
                for leftover in candidates[index..retries.max(index)].iter().rev() {
                    self.retry_queue.push_front(leftover.clone());
                }
                break;
            }
            if self.dispatch(id)? {
                started += 1;
            }
        }
        Ok(started)
    }

    /// Start one attempt. Returns whether a worker is now running.
    fn dispatch(&mut self, id: &str) -> Result<bool> {
        let mut task = self.load(id)?;
        let attempt = task.attempts + 1;
        let ancestors = self.ancestors(&task);
        let dependencies: Vec<Task> = task
            .depends_on
            .iter()
            .filter_map(|dep| self.tasks.get(dep))
            .filter(|dep| dep.status == TaskStatus::Completed)
            .cloned()
            .collect();
        let prompt = self.prompts.render_worker(&WorkerPromptInput {
            task: &task,
            ancestors: &ancestors,
            dependencies: &dependencies,
            attempt,
        })?;
        let request = WorkerRequest {
            task_id: task.id.clone(),
            title: task.title.clone(),
            attempt,
            prompt,
        };

        let statuses = self.statuses();
        let submitted = self
            .pool
            .submit(self.backend.as_ref(), request, &task.depends_on, &statuses)
            .map(|record| record.started_at.clone());
        task.transition(TaskStatus::InProgress)?;
        match submitted {
            Ok(_) => {
                let chain = self.graph.depth(id).unwrap_or_default();
                info!(task_id = %id, attempt, chain, title = %task.title, "worker started");
                self.save(task)?;
                self.dispatched.insert(id.to_string());
                Ok(true)
            }
            Err(err) if err.downcast_ref::<PoolError>().is_some() => Err(err),
            Err(err) => {
                warn!(task_id = %id, err = %err, "worker failed to start");
                self.save(task.clone())?;
                let now = now_rfc3339();
                self.fail_attempt(
                    task,
                    &format!("worker failed to start: {err:#}"),
                    Metrics::default(),
                    &now,
                    None,
                )?;
                Ok(false)
            }
        }
    }

    fn handle_finished(&mut self, worker: FinishedWorker) -> Result<()> {
        let FinishedWorker { record, outcome } = worker;
        self.dispatched.remove(&record.task_id);
        let task = self.load(&record.task_id)?;
        match outcome {
            WorkerOutcome::Finished(result) if result.success => {
                self.judge(task, &record, result)
            }
            WorkerOutcome::Finished(result) => {
                let summary = result.summary.trim();
                let error = if summary.is_empty() {
                    "worker reported failure".to_string()
                } else {
                    format!("worker reported failure: {summary}")
                };
                self.fail_attempt(task, &error, result.metrics, &record.started_at, Some(&record))
            }
            WorkerOutcome::Errored { error, metrics } => {
                self.fail_attempt(task, &error, metrics, &record.started_at, Some(&record))
            }
        }
    }

    /// Validate a successful attempt.
    fn judge(&mut self, mut task: Task, record: &WorkerRecord, result: WorkerResult) -> Result<()> {
        let verdict = self.strategies.validator.validate(&task, &result);
        let validation = match verdict {
            Ok(validation) if validation.passed => validation,
            Ok(validation) => {
                let message = validation.message.trim();
                let error = if message.is_empty() {
                    "validation failed".to_string()
                } else {
                    format!("validation failed: {message}")
                };
                return self.fail_attempt(task, &error, result.metrics, &record.started_at, Some(record));
            }
            Err(err) => {
                let error = format!("validator error: {err:#}");
                return self.fail_attempt(task, &error, result.metrics, &record.started_at, Some(record));
            }
        };

        task.metrics += result.metrics;
        task.attempts += 1;
        let attempt = AttemptRecord {
            task_id: task.id.clone(),
            attempt: record.attempt,
            round: task.escalations,
            started_at: record.started_at.clone(),
            finished_at: now_rfc3339(),
            passed: true,
            error: None,
            summary: result.summary.clone(),
            metrics: result.metrics,
            log_path: log_path(record),
        };
        self.store
            .record_attempt(&attempt)
            .with_context(|| format!("record attempt for {}", task.id))?;

        task.artifacts = result.artifacts;
        if task.artifacts.summary.is_empty() {
            task.artifacts.summary = result.summary;
        }
        task.last_error.clear();
        task.guidance = None;
        task.transition(TaskStatus::Completed)?;
        info!(
            task_id = %task.id,
            attempt = record.attempt,
            message = %validation.message,
            cost_usd = task.metrics.cost_usd,
            "task completed"
        );
        self.save(task)
    }

    /// Record a failed attempt, then retry or escalate.
    fn fail_attempt(
        &mut self,
        mut task: Task,
        error: &str,
        metrics: Metrics,
        started_at: &str,
        record: Option<&WorkerRecord>,
    ) -> Result<()> {
        let attempt = AttemptRecord {
            task_id: task.id.clone(),
            attempt: record.map_or(task.attempts + 1, |r| r.attempt),
            round: task.escalations,
            started_at: started_at.to_string(),
            finished_at: now_rfc3339(),
            passed: false,
            error: Some(error.to_string()),
            summary: String::new(),
            metrics,
            log_path: record.and_then(log_path),
        };
        self.store
            .record_attempt(&attempt)
            .with_context(|| format!("record attempt for {}", task.id))?;

        task.metrics += metrics;
        let outcome = record_failure(&mut task, error)?;
        warn!(
            task_id = %task.id,
            attempt = task.attempts,
            max_attempts = task.max_attempts,
            error,
            "attempt failed"
        );
        let id = task.id.clone();
        self.save(task)?;
        if (self.interrupted)() {
            // Re-queued or re-escalated by `recover` on the next run.
            return Ok(());
        }
        match outcome {
            FailureOutcome::Retry => {
                self.retry_queue.push_back(id);
                Ok(())
            }
            FailureOutcome::Escalate => self.escalate(&id),
        }
    }

    /// Route a leaf that exhausted its attempts.
    fn escalate(&mut self, id: &str) -> Result<()> {
        let mut task = self.load(id)?;
        if task.status == TaskStatus::Failed {
            task.transition(TaskStatus::Escalated)?;
            self.save(task.clone())?;
        }

        let decision = if task.escalations >= self.settings.max_escalations {
            EscalationDecision {
                task_id: task.id.clone(),
                action: EscalationAction::Human,
                reason: format!("{} fixer round(s) used", task.escalations),
                guidance: None,
            }
        } else {
            let history = self
                .store
                .attempts(id)
                .with_context(|| format!("load attempts for {id}"))?;
            self.strategies
                .escalator
                .escalate(&task, &history)
                .unwrap_or_else(|err| {
                    warn!(task_id = %id, err = %err, "escalator failed; asking a human");
                    EscalationDecision {
                        task_id: task.id.clone(),
                        action: EscalationAction::Human,
                        reason: format!("escalator error: {err:#}"),
                        guidance: None,
                    }
                })
        };

        let outcome = apply_escalation(&mut task, &decision, self.settings.max_escalations)?;
        self.save(task)?;
        match outcome {
            EscalationOutcome::FixRetry => {
                info!(task_id = %id, reason = %decision.reason, "fixer round queued");
                self.retry_queue.push_back(id.to_string());
            }
            EscalationOutcome::NeedsHuman => {
                warn!(task_id = %id, reason = %decision.reason, "task needs a human");
            }
        }
        Ok(())
    }

    /// Cancel every worker and record the interrupted attempts.
    fn shutdown(&mut self, reason: &str) -> Result<()> {
        let cancelled = self.pool.cancel_all(self.settings.cancel_grace, reason);
        if !cancelled.is_empty() {
            warn!(workers = cancelled.len(), "cancelled running workers");
        }
        for worker in cancelled {
            self.handle_finished(worker)?;
        }
        self.apply_rollups()
    }

    fn fail_structural(&mut self, id: &str, defect: &StructuralError) -> Result<()> {
        error!(task_id = %id, defect = %defect, "structural defect");
        let mut task = self.load(id)?;
        task.fatal = true;
        task.last_error = defect.to_string();
        if task.status != TaskStatus::Failed {
            task.transition(TaskStatus::Failed)?;
        }
        self.save(task)
    }

    fn apply_rollups(&mut self) -> Result<()> {
        for group in apply_rollups(&self.tasks) {
            debug!(task_id = %group.id, status = %group.status, "group rolled up");
            self.save(group)?;
        }
        Ok(())
    }

    fn save(&mut self, mut task: Task) -> Result<()> {
        task.updated_at = now_rfc3339();
        self.store
            .put_task(&task)
            .with_context(|| format!("persist task {}", task.id))?;
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Task> {
        self.tasks
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown task {id}"))
    }

    fn statuses(&self) -> HashMap<String, TaskStatus> {
        self.tasks
            .iter()
            .map(|(id, task)| (id.clone(), task.status))
            .collect()
    }

    /// Ancestors of `task`, root first.
    fn ancestors(&self, task: &Task) -> Vec<Task> {
        let mut chain = Vec::new();
        let mut cursor = task.parent_id.as_deref();
        while let Some(parent) = cursor.and_then(|id| self.tasks.get(id)) {
            if chain.len() > self.tasks.len() {
                break;
            }
            chain.push(parent.clone());
            cursor = parent.parent_id.as_deref();
        }
        chain.reverse();
        chain
    }

    /// Task ids in depth-first pre-order from `root_id`, children in split order.
    fn preorder(&self, root_id: &str) -> Vec<String> {
        let mut order = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![root_id.to_string()];
        while let Some(id) = stack.pop() {
            let Some(task) = self.tasks.get(&id) else {
                continue;
            };
            if !seen.insert(id.clone()) {
                continue;
            }
            stack.extend(task.children.iter().rev().cloned());
            order.push(id);
        }
        order
    }
}

fn log_path(record: &WorkerRecord) -> Option<String> {
    record
        .log_path
        .as_ref()
        .map(|path| path.display().to_string())
}
