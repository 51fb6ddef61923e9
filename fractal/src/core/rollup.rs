//! Derived status and metrics for grouping tasks.

use std::collections::HashMap;

use crate::core::metrics::Metrics;
use crate::task::{Task, TaskStatus};

/// Status of a grouping task given its children.
///
/// `completed` iff every child completed; `failed` iff some child needs a human or
/// failed with no automatic retry left; otherwise `in_progress`.
pub fn rollup_status<'a>(children: impl IntoIterator<Item = &'a Task>) -> TaskStatus {
    let mut all_completed = true;
    let mut blocked = false;
    for child in children {
        match child.status {
            TaskStatus::Completed => {}
            TaskStatus::NeedsHuman => {
                all_completed = false;
                blocked = true;
            }
            TaskStatus::Failed => {
                all_completed = false;
                if child.is_grouping() || !child.is_retryable() {
                    blocked = true;
                }
            }
            TaskStatus::Pending | TaskStatus::InProgress | TaskStatus::Escalated => {
                all_completed = false;
            }
        }
    }
    if blocked {
        TaskStatus::Failed
    } else if all_completed {
        TaskStatus::Completed
    } else {
        TaskStatus::InProgress
    }
}

pub fn rollup_metrics<'a>(children: impl IntoIterator<Item = &'a Task>) -> Metrics {
    let mut total = Metrics::default();
    for child in children {
        total += child.metrics;
    }
    total
}

/// Recompute every grouping task bottom-up and return the ones that changed.
///
/// Nested groups are evaluated before their parents so a change propagates to the
/// root in one pass. Missing children are skipped.
pub fn apply_rollups(tasks: &HashMap<String, Task>) -> Vec<Task> {
    let mut groups: Vec<(&Task, usize)> = tasks
        .values()
        .filter(|task| task.is_grouping())
        .map(|task| (task, nesting(tasks, task)))
        .collect();
    groups.sort_by(|(a, da), (b, db)| db.cmp(da).then_with(|| a.id.cmp(&b.id)));

    let mut updated: HashMap<String, Task> = HashMap::new();
    let mut changed_order = Vec::new();
    for (group, _) in groups {
        let children: Vec<&Task> = group
            .children
            .iter()
            .filter_map(|id| updated.get(id).or_else(|| tasks.get(id)))
            .collect();
        if children.is_empty() {
            continue;
        }
        let status = rollup_status(children.iter().copied());
        let metrics = rollup_metrics(children.iter().copied());
        if status != group.status || metrics != group.metrics {
            let mut next = group.clone();
            next.status = status;
            next.metrics = metrics;
            changed_order.push(next.id.clone());
            updated.insert(next.id.clone(), next);
        }
    }

    changed_order
        .into_iter()
        .filter_map(|id| updated.remove(&id))
        .collect()
}

/// Number of ancestors reachable through `parent_id`.
fn nesting(tasks: &HashMap<String, Task>, task: &Task) -> usize {
    let mut level = 0;
    let mut cursor = task.parent_id.as_deref();
    while let Some(parent) = cursor {
        level += 1;
        if level > tasks.len() {
            break;
        }
        cursor = tasks.get(parent).and_then(|p| p.parent_id.as_deref());
    }
    level
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{group, leaf};

    fn map(tasks: Vec<Task>) -> HashMap<String, Task> {
        tasks.into_iter().map(|t| (t.id.clone(), t)).collect()
    }

    #[test]
    fn all_children_completed_completes_group() {
        let a = leaf("a", TaskStatus::Completed);
        let b = leaf("b", TaskStatus::Completed);
        assert_eq!(rollup_status([&a, &b]), TaskStatus::Completed);
    }

    #[test]
    fn retryable_failure_keeps_group_in_progress() {
        let a = leaf("a", TaskStatus::Completed);
        let mut b = leaf("b", TaskStatus::Failed);
        b.attempts = 1;
        assert_eq!(rollup_status([&a, &b]), TaskStatus::InProgress);
    }

    #[test]
    fn needs_human_or_fatal_fails_group() {
        let a = leaf("a", TaskStatus::NeedsHuman);
        assert_eq!(rollup_status([&a]), TaskStatus::Failed);

        let mut b = leaf("b", TaskStatus::Failed);
        b.fatal = true;
        let c = leaf("c", TaskStatus::InProgress);
        assert_eq!(rollup_status([&b, &c]), TaskStatus::Failed);
    }

    #[test]
    fn escalated_child_is_still_in_flight() {
        let a = leaf("a", TaskStatus::Escalated);
        assert_eq!(rollup_status([&a]), TaskStatus::InProgress);
    }

    #[test]
    fn rollups_propagate_to_root_in_one_pass() {
        let mut a = leaf("a", TaskStatus::Completed);
        a.parent_id = Some("mid".into());
        a.metrics.cost_usd = 1.5;
        let mut b = leaf("b", TaskStatus::Completed);
        b.parent_id = Some("root".into());
        b.metrics.cost_usd = 0.5;
        let mut mid = group("mid", &["a"]);
        mid.parent_id = Some("root".into());
        let root = group("root", &["mid", "b"]);

        let changed = apply_rollups(&map(vec![a, b, mid, root]));
        let ids: Vec<&str> = changed.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, ["mid", "root"]);
        assert_eq!(changed[1].status, TaskStatus::Completed);
        assert!((changed[1].metrics.cost_usd - 2.0).abs() < 1e-9);
    }

    #[test]
    fn unchanged_groups_are_not_reported() {
        let a = leaf("a", TaskStatus::Pending);
        let mut root = group("root", &["a"]);
        root.status = TaskStatus::InProgress;
        assert!(apply_rollups(&map(vec![a, root])).is_empty());
    }
}
