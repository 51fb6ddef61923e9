//! Resolution of planner-local child ids.
//!
//! A split response names its children with ids that only mean something inside
//! that response. Everything is checked here, before any child task exists, so a
//! malformed split never leaves half a subtree behind.

use std::collections::{HashMap, HashSet};

use crate::core::error::{GraphError, StructuralError};
use crate::core::graph::TaskGraph;
use crate::core::types::PlannedChild;

/// Sibling dependencies expressed as indices into the planner's child list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSplit {
    pub local_ids: Vec<String>,
    /// `deps[i]` are the indices child `i` depends on, in declaration order.
    pub deps: Vec<Vec<usize>>,
}

impl ResolvedSplit {
    /// Map sibling dependencies onto the real ids assigned to the children.
    pub fn real_dependencies(&self, real_ids: &[String]) -> Vec<Vec<String>> {
        self.deps
            .iter()
            .map(|deps| deps.iter().map(|&i| real_ids[i].clone()).collect())
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
enum Binding {
    Child(usize),
    Ambiguous,
}

/// Resolve sibling references. A child answers to its explicit id, to
/// `subtask-<index>`, to its 0-based index and to its title. Explicit ids must
/// be unique (and distinct from the `subtask-<index>` ids of unnamed children)
/// and win over generated aliases; a generated alias shared by two
/// children is only an error when something depends on it.
pub fn resolve_split(
    parent_id: &str,
    children: &[PlannedChild],
) -> Result<ResolvedSplit, StructuralError> {
    let local_ids: Vec<String> = children
        .iter()
        .enumerate()
        .map(|(i, child)| child.local_id(i))
        .collect();

    let mut seen = HashSet::new();
    for id in &local_ids {
        if !seen.insert(id.as_str()) {
            return Err(StructuralError::DuplicateLocalId {
                parent_id: parent_id.to_string(),
                local_id: id.clone(),
            });
        }
    }

    let mut index: HashMap<String, Binding> = children
        .iter()
        .enumerate()
        .filter(|(_, child)| child.id.as_deref().is_some_and(|id| !id.trim().is_empty()))
        .map(|(i, _)| (local_ids[i].clone(), Binding::Child(i)))
        .collect();
    let mut generated: HashMap<String, Binding> = HashMap::new();
    for (i, child) in children.iter().enumerate() {
        for alias in child.aliases(i) {
            if index.contains_key(&alias) {
                continue;
            }
            generated
                .entry(alias)
                .and_modify(|binding| {
                    if !matches!(binding, Binding::Child(j) if *j == i) {
                        *binding = Binding::Ambiguous;
                    }
                })
                .or_insert(Binding::Child(i));
        }
    }
    index.extend(generated);

    let mut deps = Vec::with_capacity(children.len());
    for (i, child) in children.iter().enumerate() {
        let mut resolved = Vec::new();
        for dep in &child.depends_on {
            let target = match index.get(dep.trim()) {
                Some(&Binding::Child(target)) => target,
                Some(Binding::Ambiguous) => {
                    return Err(StructuralError::AmbiguousDependency {
                        parent_id: parent_id.to_string(),
                        child: local_ids[i].clone(),
                        local_id: dep.clone(),
                    });
                }
                None => {
                    return Err(StructuralError::UnresolvedDependency {
                        parent_id: parent_id.to_string(),
                        child: local_ids[i].clone(),
                        local_id: dep.clone(),
                    });
                }
            };
            if !resolved.contains(&target) {
                resolved.push(target);
            }
        }
        deps.push(resolved);
    }

    // Sibling edges must be acyclic on their own; check them on a scratch graph.
    let mut scratch = TaskGraph::new();
    for id in &local_ids {
        scratch.add_node(id);
    }
    for (i, targets) in deps.iter().enumerate() {
        for &target in targets {
            match scratch.add_edge(&local_ids[i], &local_ids[target]) {
                Ok(()) => {}
                Err(GraphError::Cycle(cycle)) => {
                    return Err(StructuralError::CyclicSplit {
                        parent_id: parent_id.to_string(),
                        cycle,
                    });
                }
                Err(GraphError::UnknownNode(id)) => {
                    return Err(StructuralError::UnresolvedDependency {
                        parent_id: parent_id.to_string(),
                        child: local_ids[i].clone(),
                        local_id: id,
                    });
                }
            }
        }
    }

    Ok(ResolvedSplit { local_ids, deps })
}
