//! The canonical, executable form of a task.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::JobRecord;
use crate::errors::ConfigurationError;

/// Description fields that are graph bookkeeping rather than part of the
/// executable definition.
const BOOKKEEPING_FIELDS: &[&str] = &[
    "label",
    "attributes",
    "dependencies",
    "optimization",
    "dependent-task",
    "task",
];

/// A task in the full task graph.
///
/// Serializes to one entry of `full-task-graph.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// The kind that produced this task.
    pub kind: String,
    /// Unique, human-readable identity.
    pub label: String,
    /// Free-form classification (kind, platform, test-type, ...).
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    /// Symbolic dependency name to label (or, once resolved, task id).
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    /// The executable definition.
    pub task: Value,
    /// Optimization strategy, passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimization: Option<Value>,
    /// Identifier assigned once the task is scheduled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

impl Task {
    /// Creates a task with no attributes or dependencies.
    #[must_use]
    pub fn new(kind: impl Into<String>, label: impl Into<String>, task: Value) -> Self {
        Self {
            kind: kind.into(),
            label: label.into(),
            attributes: BTreeMap::new(),
            dependencies: BTreeMap::new(),
            task,
            optimization: None,
            task_id: None,
        }
    }

    /// Adds an attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Adds a dependency edge.
    #[must_use]
    pub fn with_dependency(mut self, name: impl Into<String>, label: impl Into<String>) -> Self {
        self.dependencies.insert(name.into(), label.into());
        self
    }

    /// Sets the task id.
    #[must_use]
    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Builds a task from the final job record of a transform sequence.
    ///
    /// The record must carry a non-empty `label`, a `worker-type` and a
    /// `payload` or `run` block, either at the top level or under `task`.
    /// `attributes.kind` is set to `kind` and `metadata.name` to the label.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigurationError` naming the kind, label and field when
    /// the description is malformed.
    pub fn from_description(kind: &str, record: JobRecord) -> Result<Self, ConfigurationError> {
        let best_label = record.best_label();
        let fail = |field: &str, message: &str| {
            ConfigurationError::new(message)
                .with_kind(kind)
                .with_label(best_label.clone())
                .with_field(field)
        };

        let mut fields = match record.into_value() {
            Value::Object(fields) => fields,
            _ => Map::new(),
        };

        let label = match fields.get("label") {
            Some(Value::String(label)) if !label.trim().is_empty() => label.clone(),
            _ => return Err(fail("label", "a non-empty string label is required")),
        };

        let mut attributes = match fields.remove("attributes") {
            None | Some(Value::Null) => BTreeMap::new(),
            Some(Value::Object(map)) => map.into_iter().collect(),
            Some(_) => return Err(fail("attributes", "attributes must be a mapping")),
        };
        attributes.insert("kind".to_string(), Value::String(kind.to_string()));

        let dependencies = match fields.remove("dependencies") {
            None | Some(Value::Null) => BTreeMap::new(),
            Some(Value::Object(map)) => map
                .into_iter()
                .map(|(name, dep)| match dep {
                    Value::String(dep) => Ok((name, dep)),
                    _ => Err(fail("dependencies", &format!("dependency '{name}' must name a label"))),
                })
                .collect::<Result<_, _>>()?,
            Some(_) => return Err(fail("dependencies", "dependencies must be a mapping")),
        };

        let optimization = fields.remove("optimization").filter(|v| !v.is_null());

        let mut definition = match fields.remove("task") {
            Some(Value::Object(task)) => task,
            Some(_) => return Err(fail("task", "task must be a mapping")),
            None => {
                for key in BOOKKEEPING_FIELDS {
                    fields.remove(*key);
                }
                fields
            }
        };

        if !definition.get("worker-type").is_some_and(Value::is_string) {
            return Err(fail("worker-type", "a worker-type is required"));
        }
        if !definition.contains_key("payload") && !definition.contains_key("run") {
            return Err(fail("payload", "a payload or run block is required"));
        }

        let metadata = definition
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        match metadata {
            Value::Object(metadata) => {
                metadata.insert("name".to_string(), Value::String(label.clone()));
            }
            _ => return Err(fail("metadata", "metadata must be a mapping")),
        }

        Ok(Self {
            kind: kind.to_string(),
            label,
            attributes,
            dependencies,
            task: Value::Object(definition),
            optimization,
            task_id: None,
        })
    }

    /// Returns an attribute as a string.
    #[must_use]
    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }

    /// Returns `task.metadata.name`.
    #[must_use]
    pub fn metadata_name(&self) -> Option<&str> {
        self.task.pointer("/metadata/name").and_then(Value::as_str)
    }

    /// Returns the string-valued entries of `task.tags`.
    #[must_use]
    pub fn tags(&self) -> BTreeMap<String, String> {
        string_map(self.task.get("tags"))
    }
}

/// Collects the string-valued entries of an optional JSON object.
#[must_use]
pub fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    value
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn description(value: Value) -> JobRecord {
        JobRecord::from_value(value).unwrap()
    }

    #[test]
    fn test_from_description_flat() {
        let record = description(json!({
            "label": "build-linux64/opt",
            "attributes": {"platform": "linux64"},
            "dependencies": {"toolchain": "toolchain-clang"},
            "dependent-task": {"label": "upstream"},
            "worker-type": "b-linux",
            "payload": {"command": ["make"]},
            "tags": {"kind": "build"},
        }));

        let task = Task::from_description("build", record).unwrap();
        assert_eq!(task.label, "build-linux64/opt");
        assert_eq!(task.attribute_str("kind"), Some("build"));
        assert_eq!(task.attribute_str("platform"), Some("linux64"));
        assert_eq!(task.dependencies["toolchain"], "toolchain-clang");
        assert_eq!(task.metadata_name(), Some("build-linux64/opt"));
        assert!(task.task.get("dependent-task").is_none());
        assert!(task.task.get("label").is_none());
        assert_eq!(task.tags()["kind"], "build");
    }

    #[test]
    fn test_from_description_nested_task() {
        let record = description(json!({
            "label": "t",
            "task": {"worker-type": "t-linux", "run": {"using": "run-task"}},
        }));
        let task = Task::from_description("test", record).unwrap();
        assert_eq!(task.task["worker-type"], "t-linux");
    }

    #[test]
    fn test_from_description_requires_label() {
        let err = Task::from_description(
            "build",
            description(json!({"name": "x", "worker-type": "w", "payload": {}})),
        )
        .unwrap_err();
        assert_eq!(err.field.as_deref(), Some("label"));
        assert_eq!(err.label.as_deref(), Some("x"));
    }

    #[test]
    fn test_from_description_requires_payload() {
        let err = Task::from_description(
            "build",
            description(json!({"label": "x", "worker-type": "w"})),
        )
        .unwrap_err();
        assert_eq!(err.field.as_deref(), Some("payload"));
        assert_eq!(err.kind.as_deref(), Some("build"));
    }

    #[test]
    fn test_serialization_shape() {
        let task = Task::new("build", "a", json!({"worker-type": "w"})).with_task_id("abc");
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["task_id"], "abc");
        assert!(value.get("optimization").is_none());

        let back: Task = serde_json::from_value(value).unwrap();
        assert_eq!(back, task);
    }
}
