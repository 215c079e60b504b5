//! Placeholder substitution in task definitions.
//!
//! Definitions may embed single-key objects that stand for values only
//! known later:
//!
//! - `{"task-reference": "<build>/x"}`: `<build>` becomes the task id of
//!   the `build` dependency (`<self>` and `<decision>` are also known);
//! - `{"artifact-reference": "<build/public/target.zip>"}`: the
//!   placeholder becomes the artifact URL;
//! - `{"relative-datestamp": "3 days"}`: becomes an absolute timestamp.
//!
//! In reference strings `<<` stands for a literal `<`.

use chrono::Duration;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::errors::{ConfigurationError, ReferenceError, TaskgraphError};
use crate::utils::timestamps::{
    format_time_offset, format_timestamp, from_now, is_absolute_timestamp, parse_timestamp, Timestamp,
    TimestampError,
};

const TASK_REFERENCE: &str = "task-reference";
const ARTIFACT_REFERENCE: &str = "artifact-reference";
const RELATIVE_DATESTAMP: &str = "relative-datestamp";

/// Walks `value`, replacing single-key objects whose key is in `keys` by
/// the result of `replace`.
fn recurse<E, F>(value: &Value, keys: &[&str], replace: &F) -> Result<Value, E>
where
    F: Fn(&str, &Value) -> Result<Value, E>,
{
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| recurse(item, keys, replace))
            .collect::<Result<Vec<_>, E>>()
            .map(Value::Array),
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some((key, inner)) = map.iter().next() {
                    if keys.contains(&key.as_str()) {
                        return replace(key, inner);
                    }
                }
            }
            map.iter()
                .map(|(k, v)| Ok((k.clone(), recurse(v, keys, replace)?)))
                .collect::<Result<Map<_, _>, E>>()
                .map(Value::Object)
        }
        other => Ok(other.clone()),
    }
}

/// Resolves `task-reference` and `artifact-reference` placeholders for one
/// task.
#[derive(Debug, Clone, Copy)]
pub struct ReferenceResolver<'a> {
    label: &'a str,
    dependencies: &'a BTreeMap<String, String>,
    root_url: &'a str,
    task_id: Option<&'a str>,
    decision_task_id: Option<&'a str>,
}

impl<'a> ReferenceResolver<'a> {
    /// Creates a resolver for the task `label`, whose dependency names map
    /// to task ids in `dependencies`.
    #[must_use]
    pub fn new(label: &'a str, dependencies: &'a BTreeMap<String, String>, root_url: &'a str) -> Self {
        Self {
            label,
            dependencies,
            root_url,
            task_id: None,
            decision_task_id: None,
        }
    }

    /// Makes `<self>` resolvable.
    #[must_use]
    pub fn with_task_id(mut self, task_id: &'a str) -> Self {
        self.task_id = Some(task_id);
        self
    }

    /// Makes `<decision>` resolvable.
    #[must_use]
    pub fn with_decision_task_id(mut self, task_id: &'a str) -> Self {
        self.decision_task_id = Some(task_id);
        self
    }

    /// Returns a copy of `definition` with every placeholder resolved.
    ///
    /// # Errors
    ///
    /// Returns a `ReferenceError` naming the label and key for unknown
    /// dependencies, non-public artifacts and malformed placeholders.
    pub fn resolve(&self, definition: &Value) -> Result<Value, ReferenceError> {
        recurse(definition, &[TASK_REFERENCE, ARTIFACT_REFERENCE], &|key, inner| {
            let Some(template) = inner.as_str() else {
                return Err(self.malformed(key, "value must be a string"));
            };
            let resolved = if key == TASK_REFERENCE {
                substitute(template, |name| self.task_reference(name))
            } else {
                substitute(template, |name| self.artifact_reference(name))
            };
            resolved.map(Value::String)
        })
    }

    fn malformed(&self, placeholder: &str, message: &str) -> ReferenceError {
        ReferenceError::Malformed {
            label: self.label.to_string(),
            placeholder: placeholder.to_string(),
            message: message.to_string(),
        }
    }

    fn lookup(&self, key: &str) -> Result<&'a str, ReferenceError> {
        let found = match key {
            "self" => self.task_id,
            "decision" => self.decision_task_id,
            other => self.dependencies.get(other).map(String::as_str),
        };
        found.ok_or_else(|| ReferenceError::UnresolvedPlaceholder {
            label: self.label.to_string(),
            key: key.to_string(),
        })
    }

    fn task_reference(&self, key: &str) -> Result<String, ReferenceError> {
        self.lookup(key).map(ToString::to_string)
    }

    fn artifact_reference(&self, placeholder: &str) -> Result<String, ReferenceError> {
        let Some((dependency, path)) = placeholder.split_once('/') else {
            return Err(self.malformed(ARTIFACT_REFERENCE, &format!("'<{placeholder}>' has no artifact path")));
        };
        if dependency == "self" {
            return Err(self.malformed(ARTIFACT_REFERENCE, "a task cannot reference its own artifacts"));
        }
        if !path.starts_with("public/") {
            return Err(ReferenceError::NonPublicArtifact {
                label: self.label.to_string(),
                path: path.to_string(),
            });
        }
        let task_id = self.lookup(dependency)?;
        Ok(artifact_url(self.root_url, task_id, path))
    }
}

/// Builds the public URL of an artifact.
#[must_use]
pub fn artifact_url(root_url: &str, task_id: &str, path: &str) -> String {
    format!(
        "{}/api/queue/v1/task/{task_id}/artifacts/{path}",
        root_url.trim_end_matches('/')
    )
}

/// Replaces each `<key>` in `template`. `<<` is a literal `<`; an empty
/// `<>` or a `<` with no closing `>` is kept as text.
fn substitute<F>(template: &str, mut replace: F) -> Result<String, ReferenceError>
where
    F: FnMut(&str) -> Result<String, ReferenceError>,
{
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('<') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        if let Some(escaped) = after.strip_prefix('<') {
            out.push('<');
            rest = escaped;
            continue;
        }
        match after.find('>') {
            None => {
                out.push('<');
                rest = after;
                break;
            }
            Some(0) => {
                out.push_str("<>");
                rest = &after[1..];
            }
            Some(end) => {
                out.push_str(&replace(&after[..end])?);
                rest = &after[end + 1..];
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}

/// Resolves task and artifact references with only dependency names known.
///
/// # Errors
///
/// See [`ReferenceResolver::resolve`].
pub fn resolve_task_references(
    label: &str,
    definition: &Value,
    dependencies: &BTreeMap<String, String>,
    root_url: &str,
) -> Result<Value, ReferenceError> {
    ReferenceResolver::new(label, dependencies, root_url).resolve(definition)
}

/// Replaces `{"relative-datestamp": "<offset>"}` with absolute timestamps
/// relative to `now`.
///
/// # Errors
///
/// Returns a `TimestampError` for an unparseable offset.
pub fn resolve_timestamps(now: &Timestamp, definition: &Value) -> Result<Value, TimestampError> {
    recurse(definition, &[RELATIVE_DATESTAMP], &|_, inner| {
        let offset = inner
            .as_str()
            .ok_or_else(|| TimestampError::InvalidOffset(inner.to_string()))?;
        Ok(Value::String(format_timestamp(&from_now(offset, now)?)))
    })
}

/// Replaces every absolute timestamp with a `relative-datestamp` offset from
/// the definition's `created` time.
///
/// # Errors
///
/// Returns a `ConfigurationError` if `created` is missing, or a timestamp
/// error if it cannot be parsed.
pub fn relativize_datestamps(definition: &Value) -> Result<Value, TaskgraphError> {
    let created = definition
        .get("created")
        .and_then(Value::as_str)
        .ok_or_else(|| ConfigurationError::new("task definition has no 'created' timestamp").with_field("created"))?;
    let base = parse_timestamp(created)?;
    Ok(relativize(definition, &base)?)
}

fn relativize(value: &Value, base: &Timestamp) -> Result<Value, TimestampError> {
    match value {
        Value::String(s) if is_absolute_timestamp(s) => {
            let delta: Duration = parse_timestamp(s)? - *base;
            let mut map = Map::new();
            map.insert(RELATIVE_DATESTAMP.to_string(), Value::String(format_time_offset(delta)));
            Ok(Value::Object(map))
        }
        Value::Array(items) => items
            .iter()
            .map(|item| relativize(item, base))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| Ok((k.clone(), relativize(v, base)?)))
            .collect::<Result<Map<_, _>, TimestampError>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}
