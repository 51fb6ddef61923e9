//! Task records: the unit of work persisted by the state store.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::error::IllegalTransition;
use crate::core::metrics::Metrics;

/// Default attempt ceiling for a fresh task.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Escalated,
    NeedsHuman,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Escalated => "escalated",
            Self::NeedsHuman => "needs_human",
        }
    }

    /// Whether a leaf may move from `self` to `next`.
    ///
    /// Grouping tasks are derived by roll-up and do not go through this table.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::{Completed, Escalated, Failed, InProgress, NeedsHuman, Pending};
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Failed)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (Failed, InProgress)
                | (Failed, Escalated)
                | (Escalated, InProgress)
                | (Escalated, NeedsHuman)
                | (NeedsHuman, Pending)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Advisory size estimate supplied by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskSize {
    XS,
    S,
    M,
    L,
    XL,
}

/// Opaque references to the work product of a completed attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifacts {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_changed: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
}

/// A unit of work. Leaves are dispatched to workers; tasks with children are grouping nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub children: Vec<String>,
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<TaskSize>,
    pub status: TaskStatus,
    #[serde(default)]
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub metrics: Metrics,
    #[serde(default)]
    pub artifacts: Artifacts,
    #[serde(default)]
    pub last_error: String,
    /// Set once the planner's decision for this task has been applied.
    #[serde(default)]
    pub planned: bool,
    /// Structural defect: never retried or escalated.
    #[serde(default)]
    pub fatal: bool,
    /// Fixer rounds consumed so far.
    #[serde(default)]
    pub escalations: u32,
    /// Fixer or human guidance for the next attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Task {
    pub fn is_grouping(&self) -> bool {
        !self.children.is_empty()
    }

    /// A planned task without children: eligible for dispatch to a worker.
    pub fn is_leaf(&self) -> bool {
        self.planned && self.children.is_empty()
    }

    /// Move a leaf to `next`, rejecting changes the lifecycle does not allow.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), IllegalTransition> {
        if !self.status.can_transition_to(next) {
            return Err(IllegalTransition {
                task_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// A failed task that still has automatic attempts left in the current round.
    pub fn is_retryable(&self) -> bool {
        !self.fatal && self.attempts < self.max_attempts
    }
}

/// Fields needed to create a task; the store assigns the id.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDraft {
    pub parent_id: Option<String>,
    pub title: String,
    pub description: String,
    pub size: Option<TaskSize>,
    pub max_attempts: u32,
    pub depends_on: Vec<String>,
}

impl TaskDraft {
    pub fn into_task(self, id: String, now: &str) -> Task {
        Task {
            id,
            parent_id: self.parent_id,
            children: Vec::new(),
            title: self.title,
            description: self.description,
            size: self.size,
            status: TaskStatus::Pending,
            attempts: 0,
            max_attempts: self.max_attempts,
            depends_on: self.depends_on,
            metrics: Metrics::default(),
            artifacts: Artifacts::default(),
            last_error: String::new(),
            planned: false,
            fatal: false,
            escalations: 0,
            guidance: None,
            created_at: now.to_string(),
            updated_at: now.to_string(),
        }
    }
}

/// Persisted outcome of one finished worker attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub task_id: String,
    pub attempt: u32,
    /// Escalation round the attempt belongs to (0 before any fix).
    #[serde(default)]
    pub round: u32,
    pub started_at: String,
    pub finished_at: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub metrics: Metrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
}

/// Stable task id for the file and memory backends.
pub fn new_task_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("task-{}", &uuid[..8])
}

/// Current time as RFC 3339 (UTC, second precision).
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_loop_transitions_are_allowed() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::InProgress));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::Failed.can_transition_to(TaskStatus::InProgress));
        assert!(TaskStatus::Failed.can_transition_to(TaskStatus::Escalated));
        assert!(TaskStatus::Escalated.can_transition_to(TaskStatus::InProgress));
        assert!(TaskStatus::Escalated.can_transition_to(TaskStatus::NeedsHuman));
        assert!(TaskStatus::NeedsHuman.can_transition_to(TaskStatus::Pending));
    }

    #[test]
    fn completed_is_terminal() {
        for next in [
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Failed,
            TaskStatus::Escalated,
            TaskStatus::NeedsHuman,
        ] {
            assert!(!TaskStatus::Completed.can_transition_to(next), "{next}");
        }
    }

    #[test]
    fn needs_human_cannot_skip_back_to_work() {
        assert!(!TaskStatus::NeedsHuman.can_transition_to(TaskStatus::InProgress));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
    }

    #[test]
    fn transition_rejects_illegal_moves() {
        let mut task = TaskDraft {
            parent_id: None,
            title: "t".into(),
            description: "d".into(),
            size: None,
            max_attempts: 3,
            depends_on: Vec::new(),
        }
        .into_task("task-1".into(), "2026-01-01T00:00:00Z");
        task.transition(TaskStatus::InProgress).expect("start");
        let err = task.transition(TaskStatus::NeedsHuman).expect_err("illegal");
        assert_eq!(err.from, TaskStatus::InProgress);
        assert_eq!(task.status, TaskStatus::InProgress);
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&TaskStatus::NeedsHuman).expect("serialize");
        assert_eq!(json, "\"needs_human\"");
    }

    #[test]
    fn task_ids_have_stable_shape() {
        let id = new_task_id();
        assert!(id.starts_with("task-"));
        assert_eq!(id.len(), "task-".len() + 8);
        assert_ne!(id, new_task_id());
    }

    #[test]
    fn task_without_optional_fields_deserializes() {
        let raw = r#"{
            "id": "task-1",
            "title": "t",
            "description": "d",
            "status": "pending",
            "max_attempts": 3,
            "created_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-01T00:00:00Z"
        }"#;
        let task: Task = serde_json::from_str(raw).expect("parse");
        assert!(task.children.is_empty());
        assert_eq!(task.metrics, Metrics::default());
        assert!(!task.planned);
        assert!(task.is_retryable());
    }
}
