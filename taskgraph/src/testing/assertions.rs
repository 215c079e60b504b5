//! Assertions over graphs and task definitions.

use serde_json::Value;
use std::collections::BTreeSet;

use super::mocks::RecordingSubmitter;
use crate::graph::TaskGraph;

const PLACEHOLDER_KEYS: &[&str] = &["task-reference", "artifact-reference", "relative-datestamp"];

fn find_placeholder(value: &Value, path: &str) -> Option<String> {
    match value {
        Value::Object(map) => {
            if map.len() == 1 && map.keys().any(|k| PLACEHOLDER_KEYS.contains(&k.as_str())) {
                return Some(path.to_string());
            }
            map.iter()
                .find_map(|(k, v)| find_placeholder(v, &format!("{path}.{k}")))
        }
        Value::Array(items) => items
            .iter()
            .enumerate()
            .find_map(|(i, v)| find_placeholder(v, &format!("{path}[{i}]"))),
        _ => None,
    }
}

/// Asserts that no placeholder object remains anywhere in `definition`.
pub fn assert_no_placeholders(definition: &Value) {
    if let Some(path) = find_placeholder(definition, "$") {
        panic!("Expected a fully resolved definition, found a placeholder at {path}");
    }
}

/// Asserts that every task is named after its label and every dependency
/// points at a task of the graph.
pub fn assert_graph_consistent(graph: &TaskGraph) {
    for task in graph.tasks() {
        assert!(!task.label.is_empty(), "Found a task with an empty label");
        assert_eq!(
            task.metadata_name(),
            Some(task.label.as_str()),
            "Task '{}' has metadata.name {:?}",
            task.label,
            task.metadata_name()
        );
        for (name, dependency) in &task.dependencies {
            assert!(
                graph.contains(dependency),
                "Task '{}' dependency '{}' points at unknown label '{}'",
                task.label,
                name,
                dependency
            );
        }
    }
}

/// Asserts the set of labels the submitter received, ignoring order and
/// repetition.
pub fn assert_submitted_labels(submitter: &RecordingSubmitter, expected: &[&str]) {
    let actual: BTreeSet<String> = submitter
        .submissions()
        .iter()
        .filter_map(|s| s.label().map(ToString::to_string))
        .collect();
    let expected: BTreeSet<String> = expected.iter().map(|s| (*s).to_string()).collect();
    assert_eq!(actual, expected, "Submitted labels differ");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures::task_fixture;
    use serde_json::json;

    #[test]
    fn test_assert_no_placeholders_passes() {
        assert_no_placeholders(&json!({"a": ["x", {"b": "<build>"}], "c": {"task-reference": "x", "other": 1}}));
    }

    #[test]
    #[should_panic(expected = "placeholder at $.payload.env[1]")]
    fn test_assert_no_placeholders_fails() {
        assert_no_placeholders(&json!({"payload": {"env": ["a", {"artifact-reference": "<b/public/x>"}]}}));
    }

    #[test]
    fn test_assert_graph_consistent() {
        let graph = TaskGraph::build(vec![
            task_fixture("build", "build", &[]),
            task_fixture("test", "test", &[("build", "build")]),
        ])
        .unwrap();
        assert_graph_consistent(&graph);
    }
}
