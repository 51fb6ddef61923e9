//! Retry and escalation policy for leaf tasks.
//!
//! The functions here only mutate the in-memory task; the orchestrator persists
//! the result (and the attempt record) before acting on the returned outcome.

use crate::core::error::IllegalTransition;
use crate::core::types::{EscalationAction, EscalationDecision};
use crate::task::{Task, TaskStatus};

/// What happens to a leaf after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Attempts remain in this round.
    Retry,
    /// Attempts exhausted; ask the escalator.
    Escalate,
}

/// What an applied escalation decision did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscalationOutcome {
    /// Attempts reset; the task is queued for a fixer round.
    FixRetry,
    /// Terminal until a human resolves it.
    NeedsHuman,
}

/// Record a failed attempt: count it, remember the error, and move to `failed`.
pub fn record_failure(task: &mut Task, error: &str) -> Result<FailureOutcome, IllegalTransition> {
    task.transition(TaskStatus::Failed)?;
    task.attempts = (task.attempts + 1).min(task.max_attempts);
    task.last_error = error.to_string();
    if task.is_retryable() {
        Ok(FailureOutcome::Retry)
    } else {
        Ok(FailureOutcome::Escalate)
    }
}

/// Apply an escalator decision to a task in `failed` with exhausted attempts.
///
/// `fix` is only honoured while fewer than `max_escalations` fixer rounds have run;
/// past that the task goes to a human regardless of the decision.
pub fn apply_escalation(
    task: &mut Task,
    decision: &EscalationDecision,
    max_escalations: u32,
) -> Result<EscalationOutcome, IllegalTransition> {
    if task.status == TaskStatus::Failed {
        task.transition(TaskStatus::Escalated)?;
    }
    match decision.action {
        EscalationAction::Fix if task.escalations < max_escalations => {
            task.attempts = 0;
            task.escalations += 1;
            task.guidance = decision
                .guidance
                .clone()
                .or_else(|| Some(decision.reason.clone()))
                .filter(|g| !g.trim().is_empty());
            Ok(EscalationOutcome::FixRetry)
        }
        _ => {
            task.transition(TaskStatus::NeedsHuman)?;
            if !decision.reason.is_empty() {
                task.last_error = format!("{} (escalated: {})", task.last_error, decision.reason);
            }
            Ok(EscalationOutcome::NeedsHuman)
        }
    }
}

/// External input for a task waiting on a human: back to `pending` with a fresh round.
pub fn resolve_human(task: &mut Task, note: &str) -> Result<(), IllegalTransition> {
    task.transition(TaskStatus::Pending)?;
    task.attempts = 0;
    task.escalations = 0;
    task.guidance = Some(note.to_string()).filter(|n| !n.trim().is_empty());
    Ok(())
}
