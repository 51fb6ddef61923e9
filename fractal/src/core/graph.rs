//! Dependency graph over task ids.
//!
//! Edges point from a task to the task it depends on. The graph is kept acyclic
//! by checking every new edge before it is committed, so any `TaskGraph` value
//! observed after a call returns is valid.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::core::error::{CycleError, GraphError};
use crate::task::{Task, TaskStatus};

#[derive(Debug, Default)]
pub struct TaskGraph {
    /// Insertion order; `ready()` reports in this order.
    order: Vec<String>,
    deps: HashMap<String, BTreeSet<String>>,
    depth_cache: RefCell<HashMap<String, u32>>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the graph from persisted tasks, re-checking every edge.
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Result<Self, GraphError> {
        let tasks: Vec<&Task> = tasks.into_iter().collect();
        let mut graph = Self::new();
        for task in &tasks {
            graph.add_node(&task.id);
        }
        for task in &tasks {
            for dep in &task.depends_on {
                graph.add_edge(&task.id, dep)?;
            }
        }
        Ok(graph)
    }

    /// Register a node. Idempotent.
    pub fn add_node(&mut self, task_id: &str) {
        if self.deps.contains_key(task_id) {
            return;
        }
        self.order.push(task_id.to_string());
        self.deps.insert(task_id.to_string(), BTreeSet::new());
    }

    /// Record that `from` depends on `to`.
    ///
    /// Fails without mutating the graph if either node is unknown or the edge would
    /// close a cycle.
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<(), GraphError> {
        for id in [from, to] {
            if !self.deps.contains_key(id) {
                return Err(GraphError::UnknownNode(id.to_string()));
            }
        }
        if self.deps[from].contains(to) {
            return Ok(());
        }
        if let Some(path) = self.find_path(to, from) {
            let mut cycle = Vec::with_capacity(path.len() + 1);
            cycle.push(from.to_string());
            cycle.extend(path);
            return Err(CycleError { path: cycle }.into());
        }

        if let Some(deps) = self.deps.get_mut(from) {
            deps.insert(to.to_string());
        }
        self.depth_cache.borrow_mut().clear();
        Ok(())
    }

    /// Depth-first search along dependency edges. Returns `start ..= target` if reachable.
    fn find_path(&self, start: &str, target: &str) -> Option<Vec<String>> {
        let mut parent: HashMap<&str, &str> = HashMap::new();
        let mut visited: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = vec![start];

        while let Some(node) = stack.pop() {
            if !visited.insert(node) {
                continue;
            }
            if node == target {
                let mut path = vec![node.to_string()];
                let mut cursor = node;
                while let Some(prev) = parent.get(cursor) {
                    path.push((*prev).to_string());
                    cursor = prev;
                }
                path.reverse();
                return Some(path);
            }
            for next in self.deps.get(node).into_iter().flatten() {
                if !visited.contains(next.as_str()) {
                    parent.entry(next.as_str()).or_insert(node);
                    stack.push(next.as_str());
                }
            }
        }
        None
    }

    /// Pending tasks whose dependencies are all completed, excluding `dispatched`.
    ///
    /// Tasks missing from `statuses` are treated as not completed.
    pub fn ready(
        &self,
        statuses: &HashMap<String, TaskStatus>,
        dispatched: &HashSet<String>,
    ) -> Vec<String> {
        let completed = |id: &String| statuses.get(id) == Some(&TaskStatus::Completed);
        self.order
            .iter()
            .filter(|id| statuses.get(*id) == Some(&TaskStatus::Pending))
            .filter(|id| !dispatched.contains(*id))
            .filter(|id| self.deps[*id].iter().all(completed))
            .cloned()
            .collect()
    }

    /// Longest dependency chain ending at `task_id` (0 when it has no dependencies).
    pub fn depth(&self, task_id: &str) -> Result<u32, GraphError> {
        if !self.deps.contains_key(task_id) {
            return Err(GraphError::UnknownNode(task_id.to_string()));
        }
        let mut cache = self.depth_cache.borrow_mut();
        let mut stack = vec![task_id];
        while let Some(&top) = stack.last() {
            if cache.contains_key(top) {
                stack.pop();
                continue;
            }
            let deps = &self.deps[top];
            let missing: Vec<&str> = deps
                .iter()
                .map(String::as_str)
                .filter(|dep| !cache.contains_key(*dep))
                .collect();
            if missing.is_empty() {
                let depth = deps.iter().map(|dep| cache[dep] + 1).max().unwrap_or(0);
                cache.insert(top.to_string(), depth);
                stack.pop();
            } else {
                stack.extend(missing);
            }
        }
        Ok(cache[task_id])
    }

    /// All edges as `(from, to)` pairs in insertion order of `from`.
    pub fn edges(&self) -> Vec<(String, String)> {
        self.order
            .iter()
            .flat_map(|from| {
                self.deps[from]
                    .iter()
                    .map(move |to| (from.clone(), to.clone()))
            })
            .collect()
    }
}
