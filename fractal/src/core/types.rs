//! Decision and result types exchanged between the state machine and its strategies.
//!
//! These are plain data: planner, validator, escalator and worker backends produce
//! them, and the orchestrator consumes them once.

use serde::{Deserialize, Serialize};

use crate::core::metrics::Metrics;
use crate::task::{Artifacts, TaskSize};

/// A child proposed by the planner. `depends_on` refers to sibling local ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedChild {
    /// Local id scoped to one split response; defaults to `subtask-<index>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<TaskSize>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl PlannedChild {
    pub fn local_id(&self, index: usize) -> String {
        match &self.id {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => format!("subtask-{index}"),
        }
    }

    /// Names siblings may use to refer to this child besides its explicit id:
    /// `subtask-<index>`, the 0-based index and the title.
    pub fn aliases(&self, index: usize) -> Vec<String> {
        let mut aliases = vec![format!("subtask-{index}"), index.to_string()];
        let title = self.title.trim();
        if !title.is_empty() {
            aliases.push(title.to_string());
        }
        aliases
    }
}

/// Planner verdict for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanDecision {
    Split {
        size: Option<TaskSize>,
        children: Vec<PlannedChild>,
    },
    Execute {
        size: Option<TaskSize>,
    },
}

/// What a worker attempt produced. `success == false` is a failure even without an error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerResult {
    pub success: bool,
    pub summary: String,
    pub metrics: Metrics,
    pub artifacts: Artifacts,
}

/// Validator verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validation {
    pub passed: bool,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationAction {
    Fix,
    Human,
}

/// Escalator verdict for a task that exhausted its attempts. Consumed once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscalationDecision {
    pub task_id: String,
    pub action: EscalationAction,
    pub reason: String,
    /// Fixer guidance attached to the next round's context.
    pub guidance: Option<String>,
}
