//! Structural checks over adjacency maps.

use std::collections::{BTreeMap, BTreeSet};

use crate::errors::{CycleDetectedError, StructuralError};

/// Adjacency map: node to the nodes it depends on.
pub type Adjacency = BTreeMap<String, BTreeSet<String>>;

/// Orders nodes dependencies-first, failing on the first cycle found.
///
/// Iteration is over sorted keys, so the order and the reported cycle are
/// deterministic.
///
/// # Errors
///
/// Returns a `CycleDetectedError` with the path of the cycle, closed on its
/// first node (`a -> b -> a`).
pub fn validate_dag(adjacency: &Adjacency) -> Result<Vec<String>, CycleDetectedError> {
    let dependencies = |node: &str| adjacency.get(node).into_iter().flatten();

    let mut visited: BTreeSet<&str> = BTreeSet::new();
    let mut order = Vec::with_capacity(adjacency.len());

    for root in adjacency.keys() {
        if !visited.insert(root) {
            continue;
        }
        // The stack is the current path; each frame keeps its pending deps.
        let mut stack = vec![(root.as_str(), dependencies(root))];
        let mut on_path = BTreeSet::from([root.as_str()]);

        loop {
            let Some((node, pending)) = stack.last_mut() else {
                break;
            };
            let node = *node;
            match pending.next().map(String::as_str) {
                Some(dep) if on_path.contains(dep) => {
                    let start = stack.iter().position(|(n, _)| *n == dep).unwrap_or(0);
                    let mut cycle: Vec<String> = stack[start..].iter().map(|(n, _)| (*n).to_string()).collect();
                    cycle.push(dep.to_string());
                    return Err(CycleDetectedError::new(cycle));
                }
                Some(dep) => {
                    if visited.insert(dep) {
                        on_path.insert(dep);
                        stack.push((dep, dependencies(dep)));
                    }
                }
                None => {
                    on_path.remove(node);
                    order.push(node.to_string());
                    stack.pop();
                }
            }
        }
    }
    Ok(order)
}

/// Checks that every dependency target is itself a node.
///
/// # Errors
///
/// Returns `StructuralError::DanglingDependency` for the first missing
/// target. `name` reports the dependency name via `names`, when known.
pub fn validate_dependencies_exist(
    adjacency: &Adjacency,
    names: impl Fn(&str, &str) -> String,
) -> Result<(), StructuralError> {
    for (label, deps) in adjacency {
        if let Some(missing) = deps.iter().find(|dep| !adjacency.contains_key(dep.as_str())) {
            return Err(StructuralError::DanglingDependency {
                label: label.clone(),
                name: names(label, missing),
                dependency: missing.clone(),
            });
        }
    }
    Ok(())
}
