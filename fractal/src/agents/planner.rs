//! Command-backed planner.

use anyhow::Result;
use serde::Deserialize;
use tracing::{debug, instrument};

use super::{DecisionCall, PlanRequest, Planner};
use crate::core::types::{PlanDecision, PlannedChild};
use crate::io::executor::{CommandExecutor, Executor};
use crate::io::prompt::PromptEngine;
use crate::task::TaskSize;

const PLAN_DECISION_SCHEMA: &str = include_str!("../../schemas/plan_decision.schema.json");

/// Answer shape accepted from a planner command.
#[derive(Debug, Deserialize)]
struct PlanAnswer {
    split: bool,
    #[serde(default)]
    size: Option<TaskSize>,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    children: Vec<PlannedChild>,
}

impl From<PlanAnswer> for PlanDecision {
    fn from(answer: PlanAnswer) -> Self {
        if answer.split {
            PlanDecision::Split {
                size: answer.size,
                children: answer.children,
            }
        } else {
            PlanDecision::Execute { size: answer.size }
        }
    }
}

pub struct CommandPlanner<E: Executor = CommandExecutor> {
    call: DecisionCall<E>,
    prompts: PromptEngine,
}

impl<E: Executor> CommandPlanner<E> {
    pub fn new(call: DecisionCall<E>) -> Self {
        Self {
            call,
            prompts: PromptEngine::new(),
        }
    }
}

impl<E: Executor> Planner for CommandPlanner<E> {
    #[instrument(skip_all, fields(task_id = %request.task.id, depth = request.depth))]
    fn plan(&self, request: &PlanRequest<'_>) -> Result<PlanDecision> {
        let prompt = self.prompts.render_planner(
            request.task,
            request.ancestors,
            request.depth,
            request.max_depth,
        )?;
        let answer: PlanAnswer =
            self.call
                .run("planner", &request.task.id, PLAN_DECISION_SCHEMA, prompt)?;
        debug!(
            split = answer.split,
            children = answer.children.len(),
            reason = %answer.reason,
            "planner answered"
        );
        Ok(answer.into())
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

    fn planner(dir: &std::path::Path, answer: serde_json::Value) -> CommandPlanner<CapturingExecutor> {
        CommandPlanner::new(DecisionCall::new(
            CapturingExecutor::new(answer),
            dir,
            &dir.join("decisions"),
            Duration::from_secs(5),
            10_000,
        ))
    }

    #[test]
    fn split_answer_becomes_split_decision() {
        let temp = tempfile::tempdir().expect("tempdir");
        let planner = planner(
            temp.path(),
            json!({
                "split": true,
                "size": "L",
                "children": [
                    {"id": "db", "title": "Schema", "description": "tables"},
                    {"id": "api", "title": "API", "description": "routes", "depends_on": ["db"]}
                ]
            }),
        );
        let task = leaf("task-1", TaskStatus::Pending);
        let decision = planner
            .plan(&PlanRequest {
                task: &task,
                ancestors: &[],
                depth: 0,
                max_depth: 3,
            })
            .expect("plan");

        let PlanDecision::Split { size, children } = decision else {
            panic!("expected split, got {decision:?}");
        };
        assert_eq!(size, Some(TaskSize::L));
        assert_eq!(children.len(), 2);
        assert_eq!(children[1].depends_on, ["db"]);

        let request = planner.call.executor().last_request.borrow().clone().expect("request");
        assert!(request.output_path.starts_with(temp.path().join("decisions/task-1")));
        assert!(request.output_schema_path.exists());
        assert!(request.prompt.contains("Depth 0 of at most 3."));
    }

    #[test]
    fn execute_answer_keeps_size() {
        let temp = tempfile::tempdir().expect("tempdir");
        let planner = planner(temp.path(), json!({"split": false, "size": "S"}));
        let task = leaf("task-1", TaskStatus::Pending);
        let decision = planner
            .plan(&PlanRequest {
                task: &task,
                ancestors: &[],
                depth: 2,
                max_depth: 2,
            })
            .expect("plan");
        assert_eq!(
            decision,
            PlanDecision::Execute {
                size: Some(TaskSize::S)
            }
        );
        assert!(planner.call.executor().prompt().contains("do not split"));
    }

    #[test]
    fn malformed_answer_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let planner = planner(temp.path(), json!({"split": "maybe"}));
        let task = leaf("task-1", TaskStatus::Pending);
        let err = planner
            .plan(&PlanRequest {
                task: &task,
                ancestors: &[],
                depth: 0,
                max_depth: 3,
            })
            .expect_err("invalid");
        assert!(format!("{err:#}").contains("schema validation failed"));
    }
}
