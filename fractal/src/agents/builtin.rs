//! Strategies used when no decision command is configured.

use anyhow::Result;

use super::{Escalator, PlanRequest, Planner, Validator};
use crate::core::types::{
    EscalationAction, EscalationDecision, PlanDecision, Validation, WorkerResult,
};
use crate::task::{AttemptRecord, Task};

/// Executes every task as a single leaf.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverSplit;

impl Planner for NeverSplit {
    fn plan(&self, request: &PlanRequest<'_>) -> Result<PlanDecision> {
        Ok(PlanDecision::Execute {
            size: request.task.size,
        })
    }
}

/// Trusts the worker's own success flag.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptSuccess;

impl Validator for AcceptSuccess {
    fn validate(&self, _task: &Task, result: &WorkerResult) -> Result<Validation> {
        let message = if result.success {
            String::new()
        } else {
            format!("worker reported failure: {}", result.summary.trim())
        };
        Ok(Validation {
            passed: result.success,
            message,
        })
    }
}

/// Hands every exhausted task to a human.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysHuman;

impl Escalator for AlwaysHuman {
    fn escalate(&self, task: &Task, history: &[AttemptRecord]) -> Result<EscalationDecision> {
        Ok(EscalationDecision {
            task_id: task.id.clone(),
            action: EscalationAction::Human,
            reason: format!("{} failed attempts", history.iter().filter(|a| !a.passed).count()),
            guidance: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskSize, TaskStatus};
    use crate::test_support::leaf;

    #[test]
    fn never_split_keeps_existing_size() {
        let mut task = leaf("a", TaskStatus::Pending);
        task.size = Some(TaskSize::M);
        let decision = NeverSplit
            .plan(&PlanRequest {
                task: &task,
                ancestors: &[],
                depth: 0,
                max_depth: 5,
            })
            .expect("plan");
        assert_eq!(
            decision,
            PlanDecision::Execute {
                size: Some(TaskSize::M)
            }
        );
    }

    #[test]
    fn accept_success_mirrors_worker_flag() {
        let task = leaf("a", TaskStatus::InProgress);
        let ok = WorkerResult {
            success: true,
            ..Default::default()
        };
        assert!(AcceptSuccess.validate(&task, &ok).expect("ok").passed);
        let failed = WorkerResult {
            success: false,
            summary: "gave up".into(),
            ..Default::default()
        };
        let verdict = AcceptSuccess.validate(&task, &failed).expect("failed");
        assert!(!verdict.passed);
        assert!(verdict.message.contains("gave up"));
    }

    #[test]
    fn always_human_routes_to_human() {
        let task = leaf("a", TaskStatus::Failed);
        let decision = AlwaysHuman.escalate(&task, &[]).expect("escalate");
        assert_eq!(decision.action, EscalationAction::Human);
        assert_eq!(decision.task_id, "a");
    }
}
