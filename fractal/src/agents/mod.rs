//! Planner, validator and escalator strategies.
//!
//! The orchestrator only sees the three traits. Each has a command-backed
//! implementation (prompt on stdin, schema-checked JSON back) and a trivial
//! built-in used when no command is configured.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::core::types::{EscalationDecision, PlanDecision, Validation, WorkerResult};
use crate::io::config::{DecisionConfig, FractalConfig};
use crate::io::executor::{
    CommandExecutor, ExecRequest, Executor, execute_and_load_json, write_output_schema,
};
use crate::io::init::FractalPaths;
use crate::task::{AttemptRecord, Task};

pub mod builtin;
pub mod escalator;
pub mod planner;
pub mod validator;

pub use builtin::{AcceptSuccess, AlwaysHuman, NeverSplit};
pub use escalator::CommandEscalator;
pub use planner::CommandPlanner;
pub use validator::CommandValidator;

/// What the planner sees for one task.
#[derive(Debug, Clone, Copy)]
pub struct PlanRequest<'a> {
    pub task: &'a Task,
    /// Root first.
    pub ancestors: &'a [Task],
    pub depth: u32,
    pub max_depth: u32,
}

pub trait Planner {
    fn plan(&self, request: &PlanRequest<'_>) -> Result<PlanDecision>;
}

pub trait Validator {
    /// Judge a successful attempt.
    fn validate(&self, task: &Task, result: &WorkerResult) -> Result<Validation>;
}

pub trait Escalator {
    /// Route a task that exhausted its attempts. `history` is every recorded attempt, oldest first.
    fn escalate(&self, task: &Task, history: &[AttemptRecord]) -> Result<EscalationDecision>;
}

/// The three strategies an orchestrator is built with.
pub struct Strategies {
    pub planner: Box<dyn Planner>,
    pub validator: Box<dyn Validator>,
    pub escalator: Box<dyn Escalator>,
}

impl Strategies {
    /// Built-ins only: never split, accept every successful attempt, hand failures to a human.
    pub fn builtin() -> Self {
        Self {
            planner: Box::new(NeverSplit),
            validator: Box::new(AcceptSuccess),
            escalator: Box::new(AlwaysHuman),
        }
    }

    pub fn from_config(config: &FractalConfig, paths: &FractalPaths) -> Self {
        let call = |decision: &DecisionConfig| {
            DecisionCall::from_config(decision, &paths.root, &paths.decisions_dir)
        };
        let planner: Box<dyn Planner> = if config.planner.is_builtin() {
            Box::new(NeverSplit)
        } else {
            Box::new(CommandPlanner::new(call(&config.planner)))
        };
        let validator: Box<dyn Validator> = if config.validator.is_builtin() {
            Box::new(AcceptSuccess)
        } else {
            Box::new(CommandValidator::new(call(&config.validator)))
        };
        let escalator: Box<dyn Escalator> = if config.escalator.is_builtin() {
            Box::new(AlwaysHuman)
        } else {
            Box::new(CommandEscalator::new(
                call(&config.escalator),
                config.max_escalations,
            ))
        };
        Self {
            planner,
            validator,
            escalator,
        }
    }
}

/// One kind of decision command plus where its artifacts go.
///
/// Each call leaves `<decisions_dir>/<task_id>/<kind>-<timestamp>.{json,log}` behind.
pub struct DecisionCall<E: Executor> {
    executor: E,
    workdir: PathBuf,
    decisions_dir: PathBuf,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl DecisionCall<CommandExecutor> {
    pub fn from_config(config: &DecisionConfig, workdir: &Path, decisions_dir: &Path) -> Self {
        Self::new(
            CommandExecutor::new(config.command.clone()),
            workdir,
            decisions_dir,
            config.timeout(),
            config.output_limit_bytes,
        )
    }
}

impl<E: Executor> DecisionCall<E> {
    pub fn new(
        executor: E,
        workdir: &Path,
        decisions_dir: &Path,
        timeout: Duration,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            executor,
            workdir: workdir.to_path_buf(),
            decisions_dir: decisions_dir.to_path_buf(),
            timeout,
            output_limit_bytes,
        }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub(crate) fn run<T: DeserializeOwned>(
        &self,
        kind: &str,
        task_id: &str,
        schema: &str,
        prompt: String,
    ) -> Result<T> {
        let schema_path = self
            .decisions_dir
            .join("schemas")
            .join(format!("{kind}.schema.json"));
        write_output_schema(&schema_path, schema)?;

        let task_dir = self.decisions_dir.join(task_id);
        fs::create_dir_all(&task_dir)
            .with_context(|| format!("create decision dir {}", task_dir.display()))?;
        let stem = format!("{kind}-{}", Utc::now().format("%Y%m%dT%H%M%S%.3f"));
        let request = ExecRequest {
            workdir: self.workdir.clone(),
            prompt,
            output_schema_path: schema_path,
            output_path: task_dir.join(format!("{stem}.json")),
            executor_log_path: task_dir.join(format!("{stem}.log")),
            timeout: self.timeout,
            output_limit_bytes: self.output_limit_bytes,
        };
        debug!(kind, task_id, output = %request.output_path.display(), "asking decision command");
        execute_and_load_json(&self.executor, &request)
            .with_context(|| format!("{kind} decision for {task_id}"))
    }
}
