//! Command-backed validator.

use anyhow::Result;
use tracing::{debug, instrument};

use super::{DecisionCall, Validator};
use crate::core::types::{Validation, WorkerResult};
use crate::io::executor::{CommandExecutor, Executor};
use crate::io::prompt::PromptEngine;
use crate::task::Task;

const VALIDATION_SCHEMA: &str = include_str!("../../schemas/validation.schema.json");

pub struct CommandValidator<E: Executor = CommandExecutor> {
    call: DecisionCall<E>,
    prompts: PromptEngine,
}

impl<E: Executor> CommandValidator<E> {
    pub fn new(call: DecisionCall<E>) -> Self {
        Self {
            call,
            prompts: PromptEngine::new(),
        }
    }
}

impl<E: Executor> Validator for CommandValidator<E> {
    #[instrument(skip_all, fields(task_id = %task.id))]
    fn validate(&self, task: &Task, result: &WorkerResult) -> Result<Validation> {
        let prompt = self.prompts.render_validator(
            task,
            &result.summary,
            &result.artifacts.files_changed,
        )?;
        let validation: Validation =
            self.call
                .run("validator", &task.id, VALIDATION_SCHEMA, prompt)?;
        debug!(passed = validation.passed, "validator answered");
        Ok(validation)
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
    fn passes_summary_and_files_to_the_command() {
        let temp = tempfile::tempdir().expect("tempdir");
        let validator = CommandValidator::new(DecisionCall::new(
            CapturingExecutor::new(json!({"passed": false, "message": "no tests added"})),
            temp.path(),
            &temp.path().join("decisions"),
            Duration::from_secs(5),
            10_000,
        ));
        let task = leaf("task-1", TaskStatus::InProgress);
        let mut result = WorkerResult {
            success: true,
            summary: "implemented parser".into(),
            ..Default::default()
        };
        result.artifacts.files_changed = vec!["src/parser.rs".into()];

        let validation = validator.validate(&task, &result).expect("validate");
        assert_eq!(
            validation,
            Validation {
                passed: false,
                message: "no tests added".into()
            }
        );
        let prompt = validator.call.executor().prompt();
        assert!(prompt.contains("implemented parser"));
        assert!(prompt.contains("- src/parser.rs"));
    }
}
