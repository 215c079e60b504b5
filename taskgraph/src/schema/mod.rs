//! Schema validation for job records and action input.
//!
//! Schemas are JSON Schema documents restricted to the keywords task
//! descriptions use: `type`, `enum`, `const`, `properties`, `required`,
//! `additionalProperties`, `minProperties`, `maxProperties`, `items`,
//! `minItems`, `maxItems`, `minimum`, `maximum`, `minLength`, `maxLength`,
//! `pattern`, `anyOf`, `allOf` and `default`. Unknown keywords are ignored.

pub mod keyed_by;

pub use keyed_by::{optionally_keyed_by, resolve_keyed_by, Candidate, FieldValue, KeyedBy, Rule};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::type_name;
use crate::errors::ConfigurationError;

/// A single validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaViolation {
    /// Location of the offending value, e.g. `$.run.using`.
    pub path: String,
    /// What is wrong with it.
    pub message: String,
}

impl std::fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// A JSON Schema document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema(Value);

impl Schema {
    /// Wraps a schema document.
    #[must_use]
    pub fn new(document: Value) -> Self {
        Self(document)
    }

    /// A schema that accepts any value.
    #[must_use]
    pub fn any() -> Self {
        Self(Value::Object(Map::new()))
    }

    /// Returns the schema document.
    #[must_use]
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Validates an instance, collecting every violation.
    ///
    /// # Errors
    ///
    /// Returns all violations found when the instance does not conform.
    pub fn validate(&self, instance: &Value) -> Result<(), Vec<SchemaViolation>> {
        let mut violations = Vec::new();
        check(&self.0, instance, "$", &mut violations);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }

    /// Inserts declared `default`s for absent object properties, recursively.
    pub fn apply_defaults(&self, instance: &mut Value) {
        fill_defaults(&self.0, instance);
    }

    /// Applies defaults, then validates.
    ///
    /// A `null` instance is replaced by the schema's top-level default, or
    /// by an empty object when the schema describes an object.
    ///
    /// # Errors
    ///
    /// Returns all violations found after defaults were applied.
    pub fn validate_with_defaults(&self, instance: Value) -> Result<Value, Vec<SchemaViolation>> {
        let mut instance = match instance {
            Value::Null => match self.0.get("default") {
                Some(default) => default.clone(),
                None if self.0.get("type") == Some(&Value::from("object"))
                    || self.0.get("properties").is_some() =>
                {
                    Value::Object(Map::new())
                }
                None => Value::Null,
            },
            other => other,
        };
        self.apply_defaults(&mut instance);
        self.validate(&instance)?;
        Ok(instance)
    }
}

/// Renders violations as a single `ConfigurationError`.
#[must_use]
pub fn violations_error(violations: &[SchemaViolation]) -> ConfigurationError {
    let message = violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    let mut err = ConfigurationError::new(format!("schema validation failed: {message}"));
    if let Some(first) = violations.first() {
        if first.path != "$" {
            err = err.with_field(first.path.trim_start_matches("$."));
        }
    }
    err
}

fn push(violations: &mut Vec<SchemaViolation>, path: &str, message: String) {
    violations.push(SchemaViolation {
        path: path.to_string(),
        message,
    });
}

fn matches_type(expected: &str, instance: &Value) -> bool {
    match expected {
        "null" => instance.is_null(),
        "boolean" => instance.is_boolean(),
        "integer" => instance.is_i64() || instance.is_u64(),
        "number" => instance.is_number(),
        "string" => instance.is_string(),
        "array" => instance.is_array(),
        "object" => instance.is_object(),
        _ => false,
    }
}

fn as_count(value: Option<&Value>) -> Option<usize> {
    value
        .and_then(Value::as_u64)
        .and_then(|n| usize::try_from(n).ok())
}

#[allow(clippy::too_many_lines)]
fn check(schema: &Value, instance: &Value, path: &str, violations: &mut Vec<SchemaViolation>) {
    let Some(schema) = schema.as_object() else {
        if schema == &Value::Bool(false) {
            push(violations, path, "no value is allowed here".to_string());
        }
        return;
    };

    if let Some(expected) = schema.get("type") {
        let allowed: Vec<&str> = match expected {
            Value::String(s) => vec![s.as_str()],
            Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };
        if !allowed.is_empty() && !allowed.iter().any(|t| matches_type(t, instance)) {
            push(
                violations,
                path,
                format!("expected {}, got {}", allowed.join(" or "), type_name(instance)),
            );
            return;
        }
    }

    if let Some(Value::Array(options)) = schema.get("enum") {
        if !options.contains(instance) {
            push(violations, path, format!("{instance} is not one of {}", Value::Array(options.clone())));
        }
    }

    if let Some(expected) = schema.get("const") {
        if expected != instance {
            push(violations, path, format!("expected {expected}, got {instance}"));
        }
    }

    if let Some(Value::Array(options)) = schema.get("anyOf") {
        let satisfied = options.iter().any(|option| {
            let mut scratch = Vec::new();
            check(option, instance, path, &mut scratch);
            scratch.is_empty()
        });
        if !satisfied {
            push(violations, path, "value does not match any allowed alternative".to_string());
        }
    }

    if let Some(Value::Array(all)) = schema.get("allOf") {
        for option in all {
            check(option, instance, path, violations);
        }
    }

    match instance {
        Value::Object(map) => check_object(schema, map, path, violations),
        Value::Array(items) => {
            if let Some(min) = as_count(schema.get("minItems")) {
                if items.len() < min {
                    push(violations, path, format!("expected at least {min} items"));
                }
            }
            if let Some(max) = as_count(schema.get("maxItems")) {
                if items.len() > max {
                    push(violations, path, format!("expected at most {max} items"));
                }
            }
            if let Some(item_schema) = schema.get("items") {
                for (i, item) in items.iter().enumerate() {
                    check(item_schema, item, &format!("{path}[{i}]"), violations);
                }
            }
        }
        Value::String(s) => {
            let length = s.chars().count();
            if let Some(min) = as_count(schema.get("minLength")) {
                if length < min {
                    push(violations, path, format!("string shorter than {min}"));
                }
            }
            if let Some(max) = as_count(schema.get("maxLength")) {
                if length > max {
                    push(violations, path, format!("string longer than {max}"));
                }
            }
            if let Some(pattern) = schema.get("pattern").and_then(Value::as_str) {
                match Regex::new(pattern) {
                    Ok(re) if re.is_match(s) => {}
                    Ok(_) => push(violations, path, format!("'{s}' does not match '{pattern}'")),
                    Err(e) => push(violations, path, format!("invalid pattern '{pattern}': {e}")),
                }
            }
        }
        Value::Number(n) => {
            if let (Some(min), Some(value)) = (schema.get("minimum").and_then(Value::as_f64), n.as_f64()) {
                if value < min {
                    push(violations, path, format!("{n} is less than the minimum of {min}"));
                }
            }
            if let (Some(max), Some(value)) = (schema.get("maximum").and_then(Value::as_f64), n.as_f64()) {
                if value > max {
                    push(violations, path, format!("{n} is greater than the maximum of {max}"));
                }
            }
        }
        Value::Null | Value::Bool(_) => {}
    }
}

fn check_object(
    schema: &Map<String, Value>,
    map: &Map<String, Value>,
    path: &str,
    violations: &mut Vec<SchemaViolation>,
) {
    if let Some(Value::Array(required)) = schema.get("required") {
        for key in required.iter().filter_map(Value::as_str) {
            if !map.contains_key(key) {
                push(violations, path, format!("missing required property '{key}'"));
            }
        }
    }

    if let Some(min) = as_count(schema.get("minProperties")) {
        if map.len() < min {
            push(violations, path, format!("expected at least {min} properties"));
        }
    }
    if let Some(max) = as_count(schema.get("maxProperties")) {
        if map.len() > max {
            push(violations, path, format!("expected at most {max} properties"));
        }
    }

    let properties = schema.get("properties").and_then(Value::as_object);
    let additional = schema.get("additionalProperties");

    for (key, value) in map {
        let child = format!("{path}.{key}");
        match properties.and_then(|p| p.get(key)) {
            Some(property) => check(property, value, &child, violations),
            None => match additional {
                Some(Value::Bool(false)) => {
                    push(violations, path, format!("unexpected property '{key}'"));
                }
                Some(extra @ Value::Object(_)) => check(extra, value, &child, violations),
                _ => {}
            },
        }
    }
}

fn fill_defaults(schema: &Value, instance: &mut Value) {
    let Some(schema) = schema.as_object() else {
        return;
    };

    if let Some(Value::Array(all)) = schema.get("allOf") {
        for option in all {
            fill_defaults(option, instance);
        }
    }

    let (Some(Value::Object(properties)), Value::Object(map)) = (schema.get("properties"), instance) else {
        return;
    };

    for (key, property) in properties {
        match map.get_mut(key) {
            Some(present) => fill_defaults(property, present),
            None => {
                if let Some(default) = property.get("default") {
                    let mut default = default.clone();
                    fill_defaults(property, &mut default);
                    map.insert(key.clone(), default);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn retrigger_schema() -> Schema {
        Schema::new(json!({
            "type": "object",
            "properties": {
                "downstream": {"type": "boolean", "default": false},
                "times": {"type": "integer", "minimum": 1, "maximum": 6, "default": 1},
            },
            "additionalProperties": false,
        }))
    }

    #[test]
    fn test_defaults_applied_to_null() {
        let value = retrigger_schema().validate_with_defaults(Value::Null).unwrap();
        assert_eq!(value, json!({"downstream": false, "times": 1}));
    }

    #[test]
    fn test_explicit_values_kept() {
        let value = retrigger_schema()
            .validate_with_defaults(json!({"times": 3}))
            .unwrap();
        assert_eq!(value, json!({"downstream": false, "times": 3}));
    }

    #[test]
    fn test_range_and_type_violations() {
        let schema = retrigger_schema();
        let violations = schema
            .validate_with_defaults(json!({"times": 7, "downstream": "yes"}))
            .unwrap_err();
        assert_eq!(violations.len(), 2);
        assert!(violations.iter().any(|v| v.path == "$.times"));
        assert!(violations.iter().any(|v| v.path == "$.downstream"));
    }

    #[test]
    fn test_additional_properties_rejected() {
        let violations = retrigger_schema()
            .validate(&json!({"bogus": 1}))
            .unwrap_err();
        assert!(violations[0].message.contains("bogus"));
    }

    #[test]
    fn test_required_and_nested() {
        let schema = Schema::new(json!({
            "type": "object",
            "required": ["label", "run"],
            "properties": {
                "label": {"type": "string", "minLength": 1},
                "run": {
                    "type": "object",
                    "properties": {"using": {"enum": ["mozharness", "run-task"]}},
                },
            },
        }));

        assert!(schema
            .validate(&json!({"label": "a", "run": {"using": "run-task"}}))
            .is_ok());

        let violations = schema
            .validate(&json!({"label": "", "run": {"using": "make"}}))
            .unwrap_err();
        let paths: Vec<&str> = violations.iter().map(|v| v.path.as_str()).collect();
        assert_eq!(paths, vec!["$.label", "$.run.using"]);
    }

    #[test]
    fn test_any_of_and_items() {
        let schema = Schema::new(json!({
            "type": "array",
            "items": {"anyOf": [{"type": "string"}, {"type": "integer"}]},
            "maxItems": 2,
        }));
        assert!(schema.validate(&json!(["a", 1])).is_ok());
        assert!(schema.validate(&json!([true])).is_err());
        assert!(schema.validate(&json!(["a", "b", "c"])).is_err());
    }

    #[test]
    fn test_violations_error_names_field() {
        let violations = retrigger_schema().validate(&json!({"times": 0})).unwrap_err();
        let err = violations_error(&violations);
        assert_eq!(err.field.as_deref(), Some("times"));
        assert!(err.message.contains("minimum"));
    }
}
