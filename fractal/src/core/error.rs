//! Typed structural errors.
//!
//! These are the failures that are never retried: callers detect them with
//! `anyhow::Error::downcast_ref` and mark the affected subtree fatal.

use thiserror::Error;

use crate::task::TaskStatus;

/// An edge that would close a dependency cycle. `path` starts and ends on the same task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cyclic dependency detected: {}", .path.join(" -> "))]
pub struct CycleError {
    pub path: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error("unknown task in graph: {0}")]
    UnknownNode(String),
}

/// Defects in the shape of the work, as opposed to failed attempts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructuralError {
    #[error("task {task_id} at depth {depth} exceeds max depth {max_depth}")]
    DepthExceeded {
        task_id: String,
        depth: u32,
        max_depth: u32,
    },

    #[error("split of {parent_id} declares duplicate local id {local_id}")]
    DuplicateLocalId { parent_id: String, local_id: String },

    #[error("split of {parent_id}: child {child} depends on unknown local id {local_id}")]
    UnresolvedDependency {
        parent_id: String,
        child: String,
        local_id: String,
    },

    #[error("split of {parent_id}: child {child} depends on ambiguous local id {local_id}")]
    AmbiguousDependency {
        parent_id: String,
        child: String,
        local_id: String,
    },

    #[error("split of {parent_id} is cyclic: {cycle}")]
    CyclicSplit { parent_id: String, cycle: CycleError },

    #[error("planner failed for {task_id}: {message}")]
    PlannerFailed { task_id: String, message: String },
}

/// A leaf status change outside the lifecycle table. Reaching one is a state machine bug.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal transition for {task_id}: {from} -> {to}")]
pub struct IllegalTransition {
    pub task_id: String,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// Rejected worker pool submissions. Reaching one is a scheduler bug.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("no free worker slots ({max_workers} running)")]
    NoFreeSlots { max_workers: usize },

    #[error("task {task_id} has unmet dependencies: {}", .unmet.join(", "))]
    UnmetDependencies { task_id: String, unmet: Vec<String> },

    #[error("task {0} is already running")]
    AlreadyRunning(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_error_names_the_path() {
        let err = CycleError {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "cyclic dependency detected: a -> b -> a");
    }

    #[test]
    fn structural_error_survives_anyhow() {
        let err = anyhow::Error::new(StructuralError::DepthExceeded {
            task_id: "t".into(),
            depth: 6,
            max_depth: 5,
        });
        assert!(matches!(
            err.downcast_ref::<StructuralError>(),
            Some(StructuralError::DepthExceeded { depth: 6, .. })
        ));
    }
}
