//! Command-backed escalator.

use anyhow::Result;
use serde::Deserialize;
use tracing::{debug, instrument};

use super::{DecisionCall, Escalator};
use crate::core::types::{EscalationAction, EscalationDecision};
use crate::io::executor::{CommandExecutor, Executor};
use crate::io::prompt::PromptEngine;
use crate::task::{AttemptRecord, Task};

const ESCALATION_SCHEMA: &str = include_str!("../../schemas/escalation.schema.json");

#[derive(Debug, Deserialize)]
struct EscalationAnswer {
    action: EscalationAction,
    reason: String,
    #[serde(default)]
    guidance: Option<String>,
}

pub struct CommandEscalator<E: Executor = CommandExecutor> {
    call: DecisionCall<E>,
    prompts: PromptEngine,
    max_escalations: u32,
}

impl<E: Executor> CommandEscalator<E> {
    pub fn new(call: DecisionCall<E>, max_escalations: u32) -> Self {
        Self {
            call,
            prompts: PromptEngine::new(),
            max_escalations,
        }
    }
}

impl<E: Executor> Escalator for CommandEscalator<E> {
    #[instrument(skip_all, fields(task_id = %task.id, history = history.len()))]
    fn escalate(&self, task: &Task, history: &[AttemptRecord]) -> Result<EscalationDecision> {
        let prompt = self
            .prompts
            .render_escalator(task, history, self.max_escalations)?;
        let answer: EscalationAnswer =
            self.call
                .run("escalator", &task.id, ESCALATION_SCHEMA, prompt)?;
        debug!(action = ?answer.action, reason = %answer.reason, "escalator answered");
        Ok(EscalationDecision {
            task_id: task.id.clone(),
            action: answer.action,
            reason: answer.reason,
            guidance: answer.guidance.filter(|g| !g.trim().is_empty()),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::agents::testing::CapturingExecutor;
    use crate::task::TaskStatus;
    use crate::test_support::leaf;

    #[test]
    fn fix_answer_carries_guidance() {
        let temp = tempfile::tempdir().expect("tempdir");
        let escalator = CommandEscalator::new(
            DecisionCall::new(
                CapturingExecutor::new(json!({
                    "action": "fix",
                    "reason": "flaky fixture",
                    "guidance": "seed the RNG"
                })),
                temp.path(),
                &temp.path().join("decisions"),
                Duration::from_secs(5),
                10_000,
            ),
            2,
        );
        let mut task = leaf("task-1", TaskStatus::Failed);
        task.attempts = 3;
        let history = vec![AttemptRecord {
            task_id: "task-1".into(),
            attempt: 3,
            round: 0,
            started_at: String::new(),
            finished_at: String::new(),
            passed: false,
            error: Some("assertion failed".into()),
            summary: String::new(),
            metrics: Default::default(),
            log_path: None,
        }];

        let decision = escalator.escalate(&task, &history).expect("escalate");
        assert_eq!(decision.task_id, "task-1");
        assert_eq!(decision.action, EscalationAction::Fix);
        assert_eq!(decision.guidance.as_deref(), Some("seed the RNG"));
        let prompt = escalator.call.executor().prompt();
        assert!(prompt.contains("attempt 3: assertion failed"));
        assert!(prompt.contains("of 2."));
    }
}
