//! Job records: the mutable, kind-specific shape a task has while it flows
//! through a transform sequence.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::ConfigurationError;
use crate::schema::keyed_by::is_keyed_by;

/// Label reported for records that carry no identifying field.
pub const NO_LABEL: &str = "?no-label?";

/// One task-to-be, as a JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobRecord {
    fields: Map<String, Value>,
}

impl JobRecord {
    /// Creates an empty record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a JSON value, which must be an object.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigurationError` if the value is not an object.
    pub fn from_value(value: Value) -> Result<Self, ConfigurationError> {
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(ConfigurationError::new(format!(
                "job description must be a mapping, got {}",
                type_name(&other)
            ))),
        }
    }

    /// Unwraps the record into a JSON object value.
    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }

    /// Returns the top-level fields.
    #[must_use]
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Returns the top-level fields mutably.
    pub fn fields_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.fields
    }

    /// Looks up a dotted path such as `worker.env.MOZ_LOG`.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut current = self.fields.get(first)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    /// Looks up a dotted path and returns it as a string.
    #[must_use]
    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    /// Returns a mutable reference to the value at a dotted path.
    pub fn get_mut(&mut self, path: &str) -> Option<&mut Value> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut current = self.fields.get_mut(first)?;
        for part in parts {
            current = current.as_object_mut()?.get_mut(part)?;
        }
        Some(current)
    }

    /// Looks up a JSON pointer such as `/run/config/0`.
    #[must_use]
    pub fn pointer(&self, pointer: &str) -> Option<&Value> {
        let rest = pointer.strip_prefix('/')?;
        match rest.split_once('/') {
            None => self.fields.get(&unescape(rest)),
            Some((head, tail)) => self.fields.get(&unescape(head))?.pointer(&format!("/{tail}")),
        }
    }

    /// Returns a mutable reference to the value at a JSON pointer.
    pub fn pointer_mut(&mut self, pointer: &str) -> Option<&mut Value> {
        let rest = pointer.strip_prefix('/')?;
        match rest.split_once('/') {
            None => self.fields.get_mut(&unescape(rest)),
            Some((head, tail)) => self
                .fields
                .get_mut(&unescape(head))?
                .pointer_mut(&format!("/{tail}")),
        }
    }

    /// Returns true if the dotted path exists.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Sets a dotted path, creating intermediate mappings as needed.
    ///
    /// Returns the previous value, if any.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigurationError` if an intermediate value exists but is
    /// not a mapping.
    pub fn set(&mut self, path: &str, value: Value) -> Result<Option<Value>, ConfigurationError> {
        let (parents, leaf) = match path.rsplit_once('.') {
            Some((parents, leaf)) => (Some(parents), leaf),
            None => (None, path),
        };

        let mut target = &mut self.fields;
        if let Some(parents) = parents {
            for part in parents.split('.') {
                let entry = target
                    .entry(part.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
                target = entry.as_object_mut().ok_or_else(|| {
                    ConfigurationError::new(format!("cannot set '{path}': '{part}' is not a mapping"))
                        .with_field(path)
                })?;
            }
        }

        Ok(target.insert(leaf.to_string(), value))
    }

    /// Removes a dotted path and returns its value.
    pub fn remove(&mut self, path: &str) -> Option<Value> {
        match path.rsplit_once('.') {
            None => self.fields.remove(path),
            Some((parents, leaf)) => self.get_mut(parents)?.as_object_mut()?.remove(leaf),
        }
    }

    /// Fills this record from `defaults`, keeping the record's own values.
    ///
    /// Mappings merge recursively and sequences concatenate (defaults first).
    /// Keyed-by values are replaced, not merged.
    #[must_use]
    pub fn merge_defaults(self, defaults: &Map<String, Value>) -> Self {
        let mut merged = Value::Object(defaults.clone());
        merge_into(&mut merged, Value::Object(self.fields));
        match merged {
            Value::Object(fields) => Self { fields },
            _ => Self::default(),
        }
    }

    /// Returns the best-known label: the upstream task's label, then
    /// `label`, then `name`, else [`NO_LABEL`].
    #[must_use]
    pub fn best_label(&self) -> String {
        ["dependent-task.label", "label", "name"]
            .iter()
            .find_map(|path| self.get_str(path))
            .unwrap_or(NO_LABEL)
            .to_string()
    }
}

impl From<Map<String, Value>> for JobRecord {
    fn from(fields: Map<String, Value>) -> Self {
        Self { fields }
    }
}

/// Deep-merges `overlay` into `base`; `overlay` wins on scalar conflicts.
///
/// A keyed-by value on either side is never merged: `overlay` replaces
/// `base` whole.
pub fn merge_into(base: &mut Value, overlay: Value) {
    if is_keyed_by(base) || is_keyed_by(&overlay) {
        *base = overlay;
        return;
    }
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_into(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (Value::Array(base), Value::Array(overlay)) => base.extend(overlay),
        (slot, overlay) => *slot = overlay,
    }
}

fn unescape(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

/// Escapes a key for use as a JSON pointer token.
#[must_use]
pub fn escape_pointer_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
