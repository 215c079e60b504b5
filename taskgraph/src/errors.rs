//! Error types for the taskgraph crate.
//!
//! Every fatal path carries enough context (kind, label, field, repetition)
//! to diagnose a failure without re-running the generation or the action.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::utils::timestamps::TimestampError;

/// The main error type for taskgraph operations.
#[derive(Debug, Error)]
pub enum TaskgraphError {
    /// Schema validation failure, unresolved keyed-by field, bad input.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    /// Duplicate label, dangling dependency, dependency cycle.
    #[error("{0}")]
    Structural(#[from] StructuralError),

    /// Unresolved placeholder or missing identifier for a dependency.
    #[error("{0}")]
    Reference(#[from] ReferenceError),

    /// The execution service rejected a task or could not be reached.
    #[error("{0}")]
    Submission(#[from] SubmissionError),

    /// A timestamp could not be parsed or resolved.
    #[error("{0}")]
    Timestamp(#[from] TimestampError),

    /// A failure inside one repetition of a multi-run action.
    #[error("repetition {repetition}: {source}")]
    Repetition {
        /// Zero-based repetition index.
        repetition: usize,
        /// The underlying error.
        #[source]
        source: Box<TaskgraphError>,
    },

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML deserialization error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TaskgraphError {
    /// Tags the error with the repetition it happened in.
    #[must_use]
    pub fn with_repetition(self, repetition: usize) -> Self {
        Self::Repetition {
            repetition,
            source: Box::new(self),
        }
    }

    /// Returns the innermost error, skipping repetition wrappers.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Repetition { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Diagnostic metadata attached to structural errors.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ErrorInfo {
    /// Error code (e.g., "GRAPH-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ErrorInfo {
    /// Creates a new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Converts to a JSON object.
    #[must_use]
    pub fn to_dict(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut map = serde_json::Map::new();
        map.insert("code".to_string(), serde_json::json!(self.code));
        map.insert("summary".to_string(), serde_json::json!(self.summary));
        if let Some(ref hint) = self.fix_hint {
            map.insert("fix_hint".to_string(), serde_json::json!(hint));
        }
        if !self.context.is_empty() {
            map.insert("context".to_string(), serde_json::json!(self.context));
        }
        map
    }
}

/// Error raised when a record or input does not satisfy its configuration.
#[derive(Debug, Clone)]
pub struct ConfigurationError {
    /// The message.
    pub message: String,
    /// The kind being processed, if known.
    pub kind: Option<String>,
    /// The best-known label of the offending item.
    pub label: Option<String>,
    /// The offending field, if any.
    pub field: Option<String>,
}

impl ConfigurationError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
            label: None,
            field: None,
        }
    }

    /// Sets the kind.
    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Sets the label.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Sets the field.
    #[must_use]
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}

impl std::fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.kind, &self.label) {
            (Some(kind), Some(label)) => write!(f, "In {kind:?} kind task for {label:?}: ")?,
            (Some(kind), None) => write!(f, "In {kind:?} kind: ")?,
            (None, Some(label)) => write!(f, "In {label:?}: ")?,
            (None, None) => {}
        }
        if let Some(ref field) = self.field {
            write!(f, "field '{field}': ")?;
        }
        f.write_str(&self.message)
    }
}

impl std::error::Error for ConfigurationError {}

/// Error raised when a cycle is detected in a dependency graph.
#[derive(Debug, Clone, Error)]
#[error("Dependency cycle detected: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The path of labels forming the cycle.
    pub cycle_path: Vec<String>,
    /// Diagnostic info.
    pub error_info: ErrorInfo,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        let info = ErrorInfo::new(
            "GRAPH-CYCLE",
            format!("Task graph contains a dependency cycle: {}", cycle_path.join(" -> ")),
        )
        .with_fix_hint("Remove one of the dependencies in the cycle to break it.");

        Self {
            cycle_path,
            error_info: info,
        }
    }
}

/// Errors raised while building or traversing a graph.
#[derive(Debug, Clone, Error)]
pub enum StructuralError {
    /// Two tasks share a label.
    #[error("Duplicate task label '{label}'")]
    DuplicateLabel {
        /// The duplicated label.
        label: String,
    },

    /// A dependency edge points to a label that is not in the graph.
    #[error("Task '{label}' dependency '{name}' refers to unknown label '{dependency}'")]
    DanglingDependency {
        /// The depending task.
        label: String,
        /// The symbolic dependency name.
        name: String,
        /// The missing label.
        dependency: String,
    },

    /// The graph contains a cycle.
    #[error("{0}")]
    Cycle(#[from] CycleDetectedError),

    /// A label was looked up but is not present.
    #[error("Label '{label}' not found in {context}")]
    MissingLabel {
        /// The missing label.
        label: String,
        /// Where it was looked up.
        context: String,
    },

    /// A kind named in `kind-dependencies` is not defined.
    #[error("Kind '{kind}' depends on unknown kind '{dependency}'")]
    UnknownKind {
        /// The depending kind.
        kind: String,
        /// The missing kind.
        dependency: String,
    },
}

impl StructuralError {
    /// Creates a missing label error.
    #[must_use]
    pub fn missing_label(label: impl Into<String>, context: impl Into<String>) -> Self {
        Self::MissingLabel {
            label: label.into(),
            context: context.into(),
        }
    }
}

/// Errors raised while substituting task and artifact references.
#[derive(Debug, Clone, Error)]
pub enum ReferenceError {
    /// A placeholder names a key that is absent from the mapping.
    #[error("Task '{label}' references unknown dependency '{key}'")]
    UnresolvedPlaceholder {
        /// The task label.
        label: String,
        /// The unresolved key.
        key: String,
    },

    /// A dependency label has no identifier in the executed mapping.
    #[error("Task '{label}' dependency '{name}' ('{dependency}') has no task id")]
    MissingIdentifier {
        /// The depending task.
        label: String,
        /// The symbolic dependency name.
        name: String,
        /// The label with no identifier.
        dependency: String,
    },

    /// An artifact reference points at a non-public artifact.
    #[error("Task '{label}' artifact-reference '{path}' is not a public artifact")]
    NonPublicArtifact {
        /// The task label.
        label: String,
        /// The artifact path.
        path: String,
    },

    /// A placeholder object is malformed.
    #[error("Task '{label}' has a malformed {placeholder}: {message}")]
    Malformed {
        /// The task label.
        label: String,
        /// Placeholder kind.
        placeholder: String,
        /// Details.
        message: String,
    },
}

/// Classification of a submission failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubmissionErrorKind {
    /// Worth retrying (timeouts, 5xx, connection resets).
    Transient,
    /// The service refused the task (authorization, validation).
    Rejected,
    /// Anything else; not retried.
    Fatal,
}

/// Error raised by a task submitter.
#[derive(Debug, Clone)]
pub struct SubmissionError {
    /// Failure class.
    pub kind: SubmissionErrorKind,
    /// The identifier the task was submitted under.
    pub task_id: String,
    /// The task label, if known.
    pub label: Option<String>,
    /// The message reported by the service.
    pub message: String,
}

impl SubmissionError {
    /// Creates a new submission error.
    #[must_use]
    pub fn new(kind: SubmissionErrorKind, task_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            task_id: task_id.into(),
            label: None,
            message: message.into(),
        }
    }

    /// Creates a transient error.
    #[must_use]
    pub fn transient(task_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(SubmissionErrorKind::Transient, task_id, message)
    }

    /// Creates a rejection.
    #[must_use]
    pub fn rejected(task_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(SubmissionErrorKind::Rejected, task_id, message)
    }

    /// Creates a fatal error.
    #[must_use]
    pub fn fatal(task_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(SubmissionErrorKind::Fatal, task_id, message)
    }

    /// Sets the label.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Returns true if the error is worth retrying.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.kind == SubmissionErrorKind::Transient
    }

    /// Converts to a JSON object for reporting.
    #[must_use]
    pub fn to_dict(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut map = serde_json::Map::new();
        map.insert("kind".to_string(), serde_json::json!(self.kind));
        map.insert("task_id".to_string(), serde_json::json!(self.task_id));
        if let Some(ref label) = self.label {
            map.insert("label".to_string(), serde_json::json!(label));
        }
        map.insert("message".to_string(), serde_json::json!(self.message));
        map
    }
}

impl std::fmt::Display for SubmissionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Submitting task {}", self.task_id)?;
        if let Some(ref label) = self.label {
            write!(f, " ({label})")?;
        }
        write!(f, " failed ({:?}): {}", self.kind, self.message)
    }
}

impl std::error::Error for SubmissionError {}
