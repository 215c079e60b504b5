//! Task graphs: tasks keyed by label plus the edges their dependencies
//! imply.

use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

use super::validation::validate_dependencies_exist;
use super::{Edge, Graph};
use crate::core::Task;
use crate::errors::{StructuralError, TaskgraphError};

/// An immutable graph of tasks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskGraph {
    tasks: BTreeMap<String, Task>,
    graph: Graph,
}

impl TaskGraph {
    /// Builds a graph from tasks, deriving edges from their dependencies.
    ///
    /// # Errors
    ///
    /// Returns a `StructuralError` on duplicate labels, on a dependency
    /// naming an absent label, or on a dependency cycle.
    pub fn build(tasks: impl IntoIterator<Item = Task>) -> Result<Self, StructuralError> {
        let mut by_label = BTreeMap::new();
        for task in tasks {
            if by_label.contains_key(&task.label) {
                return Err(StructuralError::DuplicateLabel { label: task.label });
            }
            by_label.insert(task.label.clone(), task);
        }

        let graph = Self::derive_graph(&by_label);
        validate_dependencies_exist(&graph.links(), |label, dependency| {
            by_label
                .get(label)
                .and_then(|task| {
                    task.dependencies
                        .iter()
                        .find(|(_, dep)| dep.as_str() == dependency)
                        .map(|(name, _)| name.clone())
                })
                .unwrap_or_default()
        })?;
        graph.visit_postorder()?;

        Ok(Self {
            tasks: by_label,
            graph,
        })
    }

    fn derive_graph(tasks: &BTreeMap<String, Task>) -> Graph {
        let nodes = tasks.keys().cloned().collect();
        let edges = tasks
            .values()
            .flat_map(|task| {
                task.dependencies
                    .iter()
                    .map(|(name, dep)| Edge::new(task.label.clone(), dep.clone(), name.clone()))
            })
            .collect();
        Graph::new(nodes, edges)
    }

    /// Returns the underlying graph.
    #[must_use]
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Looks up a task by label.
    #[must_use]
    pub fn get(&self, label: &str) -> Option<&Task> {
        self.tasks.get(label)
    }

    /// Looks up a task by label, failing with context.
    ///
    /// # Errors
    ///
    /// Returns `StructuralError::MissingLabel` if absent.
    pub fn require(&self, label: &str) -> Result<&Task, StructuralError> {
        self.get(label)
            .ok_or_else(|| StructuralError::missing_label(label, "full task graph"))
    }

    /// Returns true if the graph has a task with this label.
    #[must_use]
    pub fn contains(&self, label: &str) -> bool {
        self.tasks.contains_key(label)
    }

    /// Iterates tasks in label order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    /// Returns the labels in order.
    #[must_use]
    pub fn labels(&self) -> Vec<&str> {
        self.tasks.keys().map(String::as_str).collect()
    }

    /// Returns the number of tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns true if the graph has no tasks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Finds a task by `task.metadata.name`.
    #[must_use]
    pub fn find_by_metadata_name(&self, name: &str) -> Option<&Task> {
        self.tasks.get(name).filter(|t| t.metadata_name() == Some(name)).or_else(|| {
            self.tasks
                .values()
                .find(|task| task.metadata_name() == Some(name))
        })
    }

    /// Restricts `labels` to those that were actually scheduled.
    #[must_use]
    pub fn intersect_with_known<'a, I>(labels: I, label_to_taskid: &BTreeMap<String, String>) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        labels
            .into_iter()
            .filter(|label| label_to_taskid.contains_key(*label))
            .cloned()
            .collect()
    }

    /// Returns the graph restricted to `labels`, keeping only internal edges.
    ///
    /// # Errors
    ///
    /// Returns `StructuralError::MissingLabel` if a label is absent.
    pub fn subgraph<'a, I>(&self, labels: I) -> Result<Self, StructuralError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut tasks = BTreeMap::new();
        for label in labels {
            tasks.insert(label.to_string(), self.require(label)?.clone());
        }
        let edges = self
            .graph
            .edges()
            .iter()
            .filter(|e| tasks.contains_key(&e.left) && tasks.contains_key(&e.right))
            .cloned()
            .collect();
        let graph = Graph::new(tasks.keys().cloned().collect(), edges);
        Ok(Self { tasks, graph })
    }

    /// Serializes to the `full-task-graph.json` shape.
    ///
    /// # Errors
    ///
    /// Returns a JSON error if a task cannot be serialized.
    pub fn to_json(&self) -> Result<Value, TaskgraphError> {
        let mut map = Map::new();
        for (label, task) in &self.tasks {
            map.insert(label.clone(), serde_json::to_value(task)?);
        }
        Ok(Value::Object(map))
    }

    /// Parses the `full-task-graph.json` shape.
    ///
    /// # Errors
    ///
    /// Returns a JSON error for malformed tasks, or a structural error if
    /// the tasks do not form a valid graph.
    pub fn from_json(value: Value) -> Result<Self, TaskgraphError> {
        let entries: BTreeMap<String, Task> = serde_json::from_value(value)?;
        for (key, task) in &entries {
            if key != &task.label {
                return Err(StructuralError::missing_label(key.clone(), format!("task labelled '{}'", task.label)).into());
            }
        }
        Ok(Self::build(entries.into_values())?)
    }
}
