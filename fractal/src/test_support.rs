//! Test-only builders and scripted fakes for the orchestrator's seams.
//!
//! Every fake is `Clone` with shared state, so a test can hand one copy to the
//! orchestrator and keep another to inspect what happened.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};

use crate::agents::{Escalator, PlanRequest, Planner, Validator};
use crate::core::metrics::{Metrics, TokenUsage};
use crate::core::types::{
    EscalationAction, EscalationDecision, PlanDecision, PlannedChild, Validation, WorkerResult,
};
use crate::io::store::{TrackerClient, TrackerIssue};
use crate::io::worker::{WorkerBackend, WorkerHandle, WorkerOutcome, WorkerRequest};
use crate::task::{AttemptRecord, DEFAULT_MAX_ATTEMPTS, Task, TaskDraft, TaskStatus};

/// A pending, unplanned task with deterministic fields. The title equals the id.
fn task(id: &str) -> Task {
    TaskDraft {
        parent_id: None,
        title: id.to_string(),
        description: format!("{id} description"),
        size: None,
        max_attempts: DEFAULT_MAX_ATTEMPTS,
        depends_on: Vec::new(),
    }
    .into_task(id.to_string(), "2026-01-01T00:00:00Z")
}

/// A planned leaf with the given status.
pub fn leaf(id: &str, status: TaskStatus) -> Task {
    let mut task = task(id);
    task.planned = true;
    task.status = status;
    task
}

/// A planned grouping task over `children`, in progress.
pub fn group(id: &str, children: &[&str]) -> Task {
    let mut task = task(id);
    task.planned = true;
    task.status = TaskStatus::InProgress;
    task.children = children.iter().map(|c| (*c).to_string()).collect();
    task
}

/// A planner child with an explicit local id.
pub fn child(local_id: &str, depends_on: &[&str]) -> PlannedChild {
    PlannedChild {
        id: Some(local_id.to_string()),
        title: local_id.to_string(),
        description: format!("{local_id} description"),
        size: None,
        depends_on: depends_on.iter().map(|d| (*d).to_string()).collect(),
    }
}

/// Usage that prices to a known, non-zero cost.
pub fn sample_metrics() -> Metrics {
    Metrics {
        tokens: TokenUsage {
            input_tokens: 1_000,
            output_tokens: 100,
            cache_read_tokens: 0,
            cache_creation_tokens: 0,
        },
        cost_usd: 0.0045,
        duration_ms: 1_500,
    }
}

// ---------------------------------------------------------------------------
// Worker backend
// ---------------------------------------------------------------------------

/// One scripted worker attempt.
#[derive(Debug, Clone)]
pub struct ScriptedAttempt {
    /// Polls answered with "still running" before the outcome is reported; `None` never finishes.
    polls: Option<u32>,
    outcome: WorkerOutcome,
}

impl ScriptedAttempt {
    pub fn succeed(summary: &str) -> Self {
        Self::finished(true, summary)
    }

    /// The agent finished but reported `success == false` without an execution error.
    pub fn fail(summary: &str) -> Self {
        Self::finished(false, summary)
    }

    /// The attempt could not produce a result.
    pub fn error(message: &str) -> Self {
        Self {
            polls: Some(0),
            outcome: WorkerOutcome::Errored {
                error: message.to_string(),
                metrics: sample_metrics(),
            },
        }
    }

    /// Runs until cancelled.
    pub fn hang() -> Self {
        Self {
            polls: None,
            outcome: WorkerOutcome::Errored {
                error: "hung".to_string(),
                metrics: Metrics::default(),
            },
        }
    }

    pub fn after_polls(mut self, polls: u32) -> Self {
        if self.polls.is_some() {
            self.polls = Some(polls);
        }
        self
    }

    fn finished(success: bool, summary: &str) -> Self {
        let mut result = WorkerResult {
            success,
            summary: summary.to_string(),
            metrics: sample_metrics(),
            ..Default::default()
        };
        result.artifacts.summary = summary.to_string();
        Self {
            polls: Some(0),
            outcome: WorkerOutcome::Finished(result),
        }
    }
}

#[derive(Debug, Default)]
struct BackendState {
    scripts: HashMap<String, VecDeque<ScriptedAttempt>>,
    default: Option<ScriptedAttempt>,
    spawned: Vec<String>,
    prompts: Vec<(String, String)>,
    running: usize,
    peak_running: usize,
    fail_spawn: bool,
    /// `(task_id, reason)` for every cancelled attempt.
    cancelled: Vec<(String, String)>,
}

/// Worker backend whose attempts follow per-title scripts.
///
/// Titles without a script (or with an exhausted one) use the default attempt,
/// which is an immediate success unless overridden.
#[derive(Debug, Clone, Default)]
pub struct ScriptedWorkerBackend {
    state: Rc<RefCell<BackendState>>,
}

impl ScriptedWorkerBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, title: &str, attempts: Vec<ScriptedAttempt>) -> Self {
        self.state
            .borrow_mut()
            .scripts
            .insert(title.to_string(), attempts.into());
        self
    }

    pub fn default_attempt(self, attempt: ScriptedAttempt) -> Self {
        self.state.borrow_mut().default = Some(attempt);
        self
    }

    /// Make every later `spawn` fail.
    pub fn fail_spawns(&self) {
        self.state.borrow_mut().fail_spawn = true;
    }

    /// Task ids in spawn order.
    pub fn spawned(&self) -> Vec<String> {
        self.state.borrow().spawned.clone()
    }

    /// Prompts handed to workers for `task_id`, in spawn order.
    pub fn prompts_for(&self, task_id: &str) -> Vec<String> {
        self.state
            .borrow()
            .prompts
            .iter()
            .filter(|(id, _)| id == task_id)
            .map(|(_, prompt)| prompt.clone())
            .collect()
    }

    pub fn running(&self) -> usize {
        self.state.borrow().running
    }

    /// Most workers ever running at once.
    pub fn peak_running(&self) -> usize {
        self.state.borrow().peak_running
    }

    pub fn cancelled(&self) -> Vec<(String, String)> {
        self.state.borrow().cancelled.clone()
    }
}

impl WorkerBackend for ScriptedWorkerBackend {
    fn spawn(&self, request: &WorkerRequest) -> Result<Box<dyn WorkerHandle>> {
        let mut state = self.state.borrow_mut();
        if state.fail_spawn {
            bail!("spawn refused for {}", request.task_id);
        }
        let scripted = state
            .scripts
            .get_mut(&request.title)
            .and_then(VecDeque::pop_front);
        let attempt = scripted
            .or_else(|| state.default.clone())
            .unwrap_or_else(|| ScriptedAttempt::succeed("done"));
        state.spawned.push(request.task_id.clone());
        state
            .prompts
            .push((request.task_id.clone(), request.prompt.clone()));
        state.running += 1;
        state.peak_running = state.peak_running.max(state.running);
        let pid = 10_000 + u32::try_from(state.spawned.len()).unwrap_or(0);
        Ok(Box::new(ScriptedHandle {
            state: Rc::clone(&self.state),
            task_id: request.task_id.clone(),
            attempt,
            pid,
            done: false,
        }))
    }
}

struct ScriptedHandle {
    state: Rc<RefCell<BackendState>>,
    task_id: String,
    attempt: ScriptedAttempt,
    pid: u32,
    done: bool,
}

impl ScriptedHandle {
    fn exit(&mut self) {
        if !self.done {
            self.done = true;
            self.state.borrow_mut().running -= 1;
        }
    }
}

impl WorkerHandle for ScriptedHandle {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn log_path(&self) -> Option<&Path> {
        None
    }

    fn try_finish(&mut self) -> Result<Option<WorkerOutcome>> {
        match &mut self.attempt.polls {
            None => Ok(None),
            Some(0) => {
                self.exit();
                Ok(Some(self.attempt.outcome.clone()))
            }
            Some(polls) => {
                *polls -= 1;
                Ok(None)
            }
        }
    }

    fn cancel(&mut self, _grace: Duration, reason: &str) -> Result<WorkerOutcome> {
        self.exit();
        self.state
            .borrow_mut()
            .cancelled
            .push((self.task_id.clone(), reason.to_string()));
        Ok(WorkerOutcome::Errored {
            error: reason.to_string(),
            metrics: Metrics::default(),
        })
    }
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct PlannerState {
    decisions: HashMap<String, PlanDecision>,
    errors: HashMap<String, String>,
    calls: Vec<(String, u32)>,
}

/// Planner answering per title; unscripted titles execute.
#[derive(Debug, Clone, Default)]
pub struct ScriptedPlanner {
    state: Rc<RefCell<PlannerState>>,
}

impl ScriptedPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn split(self, title: &str, children: Vec<PlannedChild>) -> Self {
        self.state.borrow_mut().decisions.insert(
            title.to_string(),
            PlanDecision::Split {
                size: None,
                children,
            },
        );
        self
    }

    pub fn error(self, title: &str, message: &str) -> Self {
        self.state
            .borrow_mut()
            .errors
            .insert(title.to_string(), message.to_string());
        self
    }

    /// `(title, depth)` of every call, in order.
    pub fn calls(&self) -> Vec<(String, u32)> {
        self.state.borrow().calls.clone()
    }
}

impl Planner for ScriptedPlanner {
    fn plan(&self, request: &PlanRequest<'_>) -> Result<PlanDecision> {
        let mut state = self.state.borrow_mut();
        let title = request.task.title.clone();
        state.calls.push((title.clone(), request.depth));
        if let Some(message) = state.errors.get(&title) {
            return Err(anyhow!("{message}"));
        }
        Ok(state
            .decisions
            .get(&title)
            .cloned()
            .unwrap_or(PlanDecision::Execute { size: None }))
    }
}

#[derive(Debug, Default)]
struct ValidatorState {
    verdicts: HashMap<String, VecDeque<Result<Validation, String>>>,
    calls: Vec<String>,
}

/// Validator answering from per-title queues; unscripted calls pass.
#[derive(Debug, Clone, Default)]
pub struct ScriptedValidator {
    state: Rc<RefCell<ValidatorState>>,
}

impl ScriptedValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject(self, title: &str, message: &str) -> Self {
        self.push(
            title,
            Ok(Validation {
                passed: false,
                message: message.to_string(),
            }),
        )
    }

    pub fn error(self, title: &str, message: &str) -> Self {
        self.push(title, Err(message.to_string()))
    }

    /// Titles validated, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state.borrow().calls.clone()
    }

    fn push(self, title: &str, verdict: Result<Validation, String>) -> Self {
        self.state
            .borrow_mut()
            .verdicts
            .entry(title.to_string())
            .or_default()
            .push_back(verdict);
        self
    }
}

impl Validator for ScriptedValidator {
    fn validate(&self, task: &Task, _result: &WorkerResult) -> Result<Validation> {
        let mut state = self.state.borrow_mut();
        state.calls.push(task.title.clone());
        let verdict = state
            .verdicts
            .get_mut(&task.title)
            .and_then(VecDeque::pop_front);
        match verdict {
            Some(Ok(validation)) => Ok(validation),
            Some(Err(message)) => Err(anyhow!("{message}")),
            None => Ok(Validation {
                passed: true,
                message: String::new(),
            }),
        }
    }
}

#[derive(Debug, Default)]
struct EscalatorState {
    answers: VecDeque<Result<(EscalationAction, String, Option<String>), String>>,
    calls: Vec<(String, usize)>,
}

/// Escalator answering from one queue; once empty it routes to a human.
#[derive(Debug, Clone, Default)]
pub struct ScriptedEscalator {
    state: Rc<RefCell<EscalatorState>>,
}

impl ScriptedEscalator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fix(self, reason: &str, guidance: &str) -> Self {
        self.state.borrow_mut().answers.push_back(Ok((
            EscalationAction::Fix,
            reason.to_string(),
            Some(guidance.to_string()),
        )));
        self
    }

    pub fn error(self, message: &str) -> Self {
        self.state
            .borrow_mut()
            .answers
            .push_back(Err(message.to_string()));
        self
    }

    /// `(task_id, history length)` of every call, in order.
    pub fn calls(&self) -> Vec<(String, usize)> {
        self.state.borrow().calls.clone()
    }
}

impl Escalator for ScriptedEscalator {
    fn escalate(&self, task: &Task, history: &[AttemptRecord]) -> Result<EscalationDecision> {
        let mut state = self.state.borrow_mut();
        state.calls.push((task.id.clone(), history.len()));
        let (action, reason, guidance) = match state.answers.pop_front() {
            Some(Ok(answer)) => answer,
            Some(Err(message)) => return Err(anyhow!("{message}")),
            None => (EscalationAction::Human, "no more fixes".to_string(), None),
        };
        Ok(EscalationDecision {
            task_id: task.id.clone(),
            action,
            reason,
            guidance,
        })
    }
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct TrackerState {
    issues: BTreeMap<String, TrackerIssue>,
    next_id: u32,
}

/// In-memory issue tracker.
#[derive(Debug, Clone, Default)]
pub struct FakeTracker {
    state: Rc<RefCell<TrackerState>>,
}

impl FakeTracker {
    /// The issue with `id`. Panics if it does not exist.
    pub fn issue(&self, id: &str) -> TrackerIssue {
        self.state
            .borrow()
            .issues
            .get(id)
            .cloned()
            .unwrap_or_else(|| panic!("no tracker issue {id}"))
    }

    fn update(&self, id: &str, apply: impl FnOnce(&mut TrackerIssue)) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let issue = state
            .issues
            .get_mut(id)
            .ok_or_else(|| anyhow!("issue {id} not found"))?;
        apply(issue);
        Ok(())
    }
}

impl TrackerClient for FakeTracker {
    fn create(&self, _title: &str, _description: &str) -> Result<String> {
        let mut state = self.state.borrow_mut();
        state.next_id += 1;
        let id = format!("bd-{}", state.next_id);
        state.issues.insert(
            id.clone(),
            TrackerIssue {
                id: id.clone(),
                status: "open".to_string(),
                notes: String::new(),
            },
        );
        Ok(id)
    }

    fn show(&self, id: &str) -> Result<Option<TrackerIssue>> {
        Ok(self.state.borrow().issues.get(id).cloned())
    }

    fn list(&self) -> Result<Vec<TrackerIssue>> {
        Ok(self.state.borrow().issues.values().cloned().collect())
    }

    fn set_notes(&self, id: &str, notes: &str) -> Result<()> {
        self.update(id, |issue| issue.notes = notes.to_string())
    }

    fn set_status(&self, id: &str, status: &str) -> Result<()> {
        self.update(id, |issue| issue.status = status.to_string())
    }
}
