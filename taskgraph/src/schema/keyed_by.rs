//! Keyed-by resolution.
//!
//! A field value may be conditional on another field of the same job:
//!
//! ```yaml
//! mozharness:
//!   config:
//!     by-platform:
//!       win.*: [windows.py]
//!       linux64: [linux.py]
//!       default: []
//! ```
//!
//! or, in rule form, `{"by-platform": [{"when": "win64", "then": ...}]}`.
//! Resolution replaces the conditional structure with the selected literal.

use regex::Regex;
use serde_json::{json, Map, Value};

use crate::core::{escape_pointer_token, JobRecord};
use crate::errors::ConfigurationError;

const BY_PREFIX: &str = "by-";
const WILDCARD: &str = "*";
const DEFAULT: &str = "default";
const REGEX_META: &[char] = &['.', '*', '+', '?', '[', ']', '(', ')', '{', '}', '|', '^', '$', '\\'];

/// The `when` side of a keyed-by rule.
#[derive(Debug, Clone)]
pub enum Candidate {
    /// Matches one exact value.
    Exact(String),
    /// Matches values fully matching a regular expression.
    Pattern(Regex),
    /// `*`: matches any present value.
    Wildcard,
    /// `default`: applies when nothing else matched.
    Default,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Exact(a), Self::Exact(b)) => a == b,
            (Self::Pattern(a), Self::Pattern(b)) => a.as_str() == b.as_str(),
            (Self::Wildcard, Self::Wildcard) | (Self::Default, Self::Default) => true,
            _ => false,
        }
    }
}

impl Candidate {
    /// Classifies a candidate string.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigurationError` if a pattern candidate is not a valid
    /// regular expression.
    pub fn parse(candidate: &str) -> Result<Self, ConfigurationError> {
        match candidate {
            WILDCARD => Ok(Self::Wildcard),
            DEFAULT => Ok(Self::Default),
            other if other.contains(REGEX_META) => Regex::new(&format!("^(?:{other})$"))
                .map(Self::Pattern)
                .map_err(|e| ConfigurationError::new(format!("invalid keyed-by pattern '{other}': {e}"))),
            other => Ok(Self::Exact(other.to_string())),
        }
    }
}

/// One `when`/`then` alternative.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    /// Which driving values select this rule.
    pub when: Candidate,
    /// The value installed when selected.
    pub then: Value,
}

/// A value conditional on a driving field.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedBy {
    /// The driving field, without the `by-` prefix.
    pub by: String,
    /// Alternatives in declaration order.
    pub rules: Vec<Rule>,
}

/// A field value: either a literal or a keyed-by structure.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Installed as-is.
    Literal(Value),
    /// Needs resolution against the job.
    KeyedBy(KeyedBy),
}

impl FieldValue {
    /// Parses a raw value.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigurationError` for a malformed keyed-by structure.
    pub fn parse(value: &Value) -> Result<Self, ConfigurationError> {
        let Some((by, alternatives)) = keyed_by_parts(value) else {
            return Ok(Self::Literal(value.clone()));
        };

        let rules = match alternatives {
            Value::Object(map) => map
                .iter()
                .map(|(when, then)| {
                    Ok(Rule {
                        when: Candidate::parse(when)?,
                        then: then.clone(),
                    })
                })
                .collect::<Result<Vec<_>, ConfigurationError>>()?,
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    let when = item.get("when").and_then(Value::as_str);
                    match (when, item.get("then")) {
                        (Some(when), Some(then)) => Ok(Rule {
                            when: Candidate::parse(when)?,
                            then: then.clone(),
                        }),
                        _ => Err(ConfigurationError::new(format!(
                            "keyed-by rule for '{by}' needs a string 'when' and a 'then'"
                        ))),
                    }
                })
                .collect::<Result<Vec<_>, ConfigurationError>>()?,
            _ => {
                return Err(ConfigurationError::new(format!(
                    "by-{by} must map candidates to values"
                )))
            }
        };

        Ok(Self::KeyedBy(KeyedBy {
            by: by.to_string(),
            rules,
        }))
    }
}

fn keyed_by_parts(value: &Value) -> Option<(&str, &Value)> {
    let map = value.as_object()?;
    if map.len() != 1 {
        return None;
    }
    let (key, alternatives) = map.iter().next()?;
    let by = key.strip_prefix(BY_PREFIX)?;
    matches!(alternatives, Value::Object(_) | Value::Array(_)).then_some((by, alternatives))
}

/// Returns true if `value` is a keyed-by structure.
#[must_use]
pub fn is_keyed_by(value: &Value) -> bool {
    keyed_by_parts(value).is_some()
}

fn driving_strings(value: Option<&Value>) -> Vec<String> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items.iter().flat_map(|v| driving_strings(Some(v))).collect(),
        Some(other) => vec![other.to_string()],
    }
}

impl KeyedBy {
    /// Picks the rule for a driving value: first exact match, then first
    /// pattern match, then the wildcard, then `default`.
    #[must_use]
    pub fn select(&self, driving: Option<&Value>) -> Option<&Value> {
        let values = driving_strings(driving);

        let exact = self.rules.iter().find(|rule| match &rule.when {
            Candidate::Exact(candidate) => values.iter().any(|v| v == candidate),
            _ => false,
        });
        let pattern = || {
            self.rules.iter().find(|rule| match &rule.when {
                Candidate::Pattern(re) => values.iter().any(|v| re.is_match(v)),
                _ => false,
            })
        };
        let wildcard = || {
            self.rules
                .iter()
                .find(|rule| rule.when == Candidate::Wildcard && !values.is_empty())
        };
        let default = || self.rules.iter().find(|rule| rule.when == Candidate::Default);

        exact
            .or_else(pattern)
            .or_else(wildcard)
            .or_else(default)
            .map(|rule| &rule.then)
    }
}

/// Resolves a raw value until it is a literal.
///
/// `lookup` returns the driving value for a field name.
///
/// # Errors
///
/// Returns a `ConfigurationError` naming `field`, `item_name` and the
/// unmatched driving value when no rule applies and no `schema_default` is
/// given.
pub fn evaluate<F>(
    value: &Value,
    field: &str,
    item_name: &str,
    lookup: F,
    schema_default: Option<&Value>,
) -> Result<Value, ConfigurationError>
where
    F: Fn(&str) -> Option<Value>,
{
    let mut current = value.clone();
    loop {
        let keyed = match FieldValue::parse(&current) {
            Ok(FieldValue::Literal(literal)) => return Ok(literal),
            Ok(FieldValue::KeyedBy(keyed)) => keyed,
            Err(e) => return Err(e.with_label(item_name).with_field(field)),
        };

        let driving = lookup(&keyed.by);
        current = match (keyed.select(driving.as_ref()), schema_default) {
            (Some(selected), _) => selected.clone(),
            (None, Some(default)) => return Ok(default.clone()),
            (None, None) => {
                let shown = driving.as_ref().map_or_else(|| "<unset>".to_string(), |v| v.to_string());
                return Err(ConfigurationError::new(format!(
                    "no value matched {}={shown}",
                    keyed.by
                ))
                .with_label(item_name)
                .with_field(field));
            }
        };
    }
}

fn collect_pointers(value: &Value, parts: &[&str], prefix: &str, out: &mut Vec<String>) {
    let Some((head, rest)) = parts.split_first() else {
        out.push(prefix.to_string());
        return;
    };
    match value {
        Value::Object(map) => {
            if let Some(child) = map.get(*head) {
                let next = format!("{prefix}/{}", escape_pointer_token(head));
                collect_pointers(child, rest, &next, out);
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                collect_pointers(item, parts, &format!("{prefix}/{i}"), out);
            }
        }
        _ => {}
    }
}

/// Driving value lookup: `extra`, then the record's dotted path, then the
/// record's `attributes`.
fn driving_value(record: &JobRecord, extra: &Map<String, Value>, by: &str) -> Option<Value> {
    extra
        .get(by)
        .or_else(|| record.get(by))
        .or_else(|| record.fields().get("attributes").and_then(|a| a.get(by)))
        .cloned()
}

/// Resolves the keyed-by value at dotted `field` in place.
///
/// Missing intermediate containers make this a no-op; lists along the path
/// are resolved element-wise. Literals are left unchanged.
///
/// # Errors
///
/// Returns a `ConfigurationError` when no alternative matches.
pub fn resolve_keyed_by(
    record: &mut JobRecord,
    field: &str,
    item_name: &str,
    extra: &Map<String, Value>,
) -> Result<(), ConfigurationError> {
    resolve_keyed_by_or(record, field, item_name, extra, None)
}

/// Like [`resolve_keyed_by`], falling back to `schema_default` when no
/// alternative matches.
///
/// # Errors
///
/// Returns a `ConfigurationError` when no alternative matches and no
/// default is given.
pub fn resolve_keyed_by_or(
    record: &mut JobRecord,
    field: &str,
    item_name: &str,
    extra: &Map<String, Value>,
    schema_default: Option<&Value>,
) -> Result<(), ConfigurationError> {
    let parts: Vec<&str> = field.split('.').collect();
    let mut pointers = Vec::new();
    if let Some((head, rest)) = parts.split_first() {
        if let Some(value) = record.fields().get(*head) {
            let prefix = format!("/{}", escape_pointer_token(head));
            collect_pointers(value, rest, &prefix, &mut pointers);
        }
    }

    for pointer in pointers {
        let Some(current) = record.pointer(&pointer) else {
            continue;
        };
        if !is_keyed_by(current) {
            continue;
        }
        let resolved = evaluate(
            current,
            field,
            item_name,
            |by| driving_value(record, extra, by),
            schema_default,
        )?;
        if let Some(slot) = record.pointer_mut(&pointer) {
            *slot = resolved;
        }
    }
    Ok(())
}

/// Schema accepting either `inner` or a keyed-by structure over `fields`
/// whose alternatives each satisfy `inner`.
#[must_use]
pub fn optionally_keyed_by(fields: &[&str], inner: Value) -> Value {
    let mut options = vec![inner.clone()];
    for field in fields {
        let key = format!("{BY_PREFIX}{field}");
        let alternatives = json!({
            "anyOf": [
                {"type": "object", "additionalProperties": inner.clone()},
                {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "required": ["when", "then"],
                        "properties": {"when": {"type": "string"}, "then": inner.clone()},
                    },
                },
            ],
        });
        let mut properties = Map::new();
        properties.insert(key.clone(), alternatives);
        options.push(json!({
            "type": "object",
            "properties": properties,
            "required": [key],
            "additionalProperties": false,
        }));
    }
    json!({ "anyOf": options })
}
