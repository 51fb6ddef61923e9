//! Prompt rendering for workers and decision commands.

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;

use crate::task::{AttemptRecord, Task};

const WORKER_TEMPLATE: &str = include_str!("prompts/worker.md");
const PLANNER_TEMPLATE: &str = include_str!("prompts/planner.md");
const VALIDATOR_TEMPLATE: &str = include_str!("prompts/validator.md");
const ESCALATOR_TEMPLATE: &str = include_str!("prompts/escalator.md");

/// Longest ancestor description carried into a prompt.
const ANCESTOR_DESCRIPTION_LIMIT: usize = 600;

#[derive(Debug, Clone, Serialize)]
struct TaskContext {
    id: String,
    title: String,
    description: String,
}

impl TaskContext {
    fn from_task(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            title: task.title.clone(),
            description: task.description.trim().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct AncestorContext {
    title: String,
    description: String,
}

#[derive(Debug, Clone, Serialize)]
struct DependencyContext {
    title: String,
    summary: String,
}

#[derive(Debug, Clone, Serialize)]
struct HistoryContext {
    round: u32,
    attempt: u32,
    error: String,
}

/// Inputs for one worker attempt.
#[derive(Debug, Clone)]
pub struct WorkerPromptInput<'a> {
    pub task: &'a Task,
    /// Root first.
    pub ancestors: &'a [Task],
    /// Completed dependencies.
    pub dependencies: &'a [Task],
    pub attempt: u32,
}

pub struct PromptEngine {
    env: Environment<'static>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("worker", WORKER_TEMPLATE)
            .expect("worker template should be valid");
        env.add_template("planner", PLANNER_TEMPLATE)
            .expect("planner template should be valid");
        env.add_template("validator", VALIDATOR_TEMPLATE)
            .expect("validator template should be valid");
        env.add_template("escalator", ESCALATOR_TEMPLATE)
            .expect("escalator template should be valid");
        Self { env }
    }

    pub fn render_worker(&self, input: &WorkerPromptInput<'_>) -> Result<String> {
        let task = input.task;
        let previous_error = Some(task.last_error.trim()).filter(|e| !e.is_empty());
        let template = self.env.get_template("worker")?;
        let rendered = template.render(context! {
            task => TaskContext::from_task(task),
            ancestors => ancestors(input.ancestors),
            dependencies => input.dependencies.iter().map(|dep| DependencyContext {
                title: dep.title.clone(),
                summary: dep.artifacts.summary.trim().to_string(),
            }).collect::<Vec<_>>(),
            guidance => task.guidance.as_deref().map(str::trim).filter(|g| !g.is_empty()),
            previous_error => previous_error,
            attempt => input.attempt,
            max_attempts => task.max_attempts,
        })?;
        Ok(rendered)
    }

    pub fn render_planner(
        &self,
        task: &Task,
        ancestors_root_first: &[Task],
        depth: u32,
        max_depth: u32,
    ) -> Result<String> {
        let template = self.env.get_template("planner")?;
        let rendered = template.render(context! {
            task => TaskContext::from_task(task),
            ancestors => ancestors(ancestors_root_first),
            depth => depth,
            max_depth => max_depth,
            at_max_depth => depth >= max_depth,
        })?;
        Ok(rendered)
    }

    pub fn render_validator(
        &self,
        task: &Task,
        summary: &str,
        files_changed: &[String],
    ) -> Result<String> {
        let template = self.env.get_template("validator")?;
        let rendered = template.render(context! {
            task => TaskContext::from_task(task),
            summary => summary.trim(),
            files_changed => files_changed,
        })?;
        Ok(rendered)
    }

    pub fn render_escalator(
        &self,
        task: &Task,
        history: &[AttemptRecord],
        max_escalations: u32,
    ) -> Result<String> {
        let template = self.env.get_template("escalator")?;
        let history: Vec<HistoryContext> = history
            .iter()
            .filter(|record| !record.passed)
            .map(|record| HistoryContext {
                round: record.round,
                attempt: record.attempt,
                error: record.error.clone().unwrap_or_else(|| "unknown failure".to_string()),
            })
            .collect();
        let rendered = template.render(context! {
            task => TaskContext::from_task(task),
            history => history,
            escalations => task.escalations,
            max_escalations => max_escalations,
        })?;
        Ok(rendered)
    }
}

fn ancestors(tasks: &[Task]) -> Vec<AncestorContext> {
    tasks
        .iter()
        .map(|task| AncestorContext {
            title: task.title.clone(),
            description: truncate(task.description.trim(), ANCESTOR_DESCRIPTION_LIMIT),
        })
        .collect()
}

fn truncate(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskStatus;
    use crate::test_support::leaf;

    #[test]
    fn worker_prompt_carries_context_guidance_and_error() {
        let root = {
            let mut t = leaf("root", TaskStatus::InProgress);
            t.title = "Build the service".into();
            t
        };
        let mut dep = leaf("schema", TaskStatus::Completed);
        dep.title = "Design schema".into();
        dep.artifacts.summary = "added users table".into();
        let mut task = leaf("api", TaskStatus::Failed);
        task.title = "Write API".into();
        task.description = "Expose CRUD endpoints".into();
        task.last_error = "tests failed: 3 errors".into();
        task.guidance = Some("run migrations first".into());

        let prompt = PromptEngine::new()
            .render_worker(&WorkerPromptInput {
                task: &task,
                ancestors: &[root],
                dependencies: &[dep],
                attempt: 2,
            })
            .expect("render");

        assert!(prompt.contains("# Task: Write API"));
        assert!(prompt.contains("Expose CRUD endpoints"));
        assert!(prompt.contains("**Build the service**"));
        assert!(prompt.contains("**Design schema**: added users table"));
        assert!(prompt.contains("run migrations first"));
        assert!(prompt.contains("tests failed: 3 errors"));
        assert!(prompt.contains("Attempt 2 of 3."));
    }

    #[test]
    fn first_attempt_has_no_failure_section() {
        let task = leaf("a", TaskStatus::Pending);
        let prompt = PromptEngine::new()
            .render_worker(&WorkerPromptInput {
                task: &task,
                ancestors: &[],
                dependencies: &[],
                attempt: 1,
            })
            .expect("render");
        assert!(!prompt.contains("Previous attempt failed"));
        assert!(!prompt.contains("# Context"));
    }

    #[test]
    fn planner_prompt_flags_max_depth() {
        let task = leaf("a", TaskStatus::Pending);
        let engine = PromptEngine::new();
        let at_limit = engine.render_planner(&task, &[], 5, 5).expect("render");
        assert!(at_limit.contains("do not split"));
        let below = engine.render_planner(&task, &[], 1, 5).expect("render");
        assert!(!below.contains("do not split"));
    }

    #[test]
    fn escalator_prompt_lists_failures() {
        let task = leaf("a", TaskStatus::Failed);
        let history = vec![AttemptRecord {
            task_id: "a".into(),
            attempt: 1,
            round: 0,
            started_at: String::new(),
            finished_at: String::new(),
            passed: false,
            error: Some("compile error".into()),
            summary: String::new(),
            metrics: Default::default(),
            log_path: None,
        }];
        let prompt = PromptEngine::new()
            .render_escalator(&task, &history, 1)
            .expect("render");
        assert!(prompt.contains("round 0, attempt 1: compile error"));
        assert!(prompt.contains("Fixer rounds used: 0 of 1."));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "h…");
        assert_eq!(truncate("short", 10), "short");
    }
}
