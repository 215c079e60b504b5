//! Graph configuration and run parameters.
//!
//! Both are plain serde structs with defaults, loadable from YAML or JSON.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

use crate::errors::{ConfigurationError, TaskgraphError};
use crate::utils::RetryConfig;

/// Default root URL of the execution service.
pub const DEFAULT_ROOT_URL: &str = "https://tc.example.com";

/// Settings for submitting tasks to the execution service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SubmissionConfig {
    /// Maximum concurrent submissions within one wave.
    pub max_concurrency: usize,
    /// Retry policy for transient failures.
    pub retry: RetryConfig,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 32,
            retry: RetryConfig::default(),
        }
    }
}

/// Repository-wide graph configuration (`config.yml`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct GraphConfig {
    /// Trust domain used in scopes and routes.
    pub trust_domain: String,
    /// Root URL of the execution service, used for artifact URLs.
    pub root_url: String,
    /// Submission settings.
    pub submission: SubmissionConfig,
    /// Anything else in the file.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            trust_domain: "gecko".to_string(),
            root_url: DEFAULT_ROOT_URL.to_string(),
            submission: SubmissionConfig::default(),
            extra: Map::new(),
        }
    }
}

impl GraphConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the root URL.
    #[must_use]
    pub fn with_root_url(mut self, root_url: impl Into<String>) -> Self {
        self.root_url = root_url.into();
        self
    }

    /// Sets the submission settings.
    #[must_use]
    pub fn with_submission(mut self, submission: SubmissionConfig) -> Self {
        self.submission = submission;
        self
    }

    /// Loads a YAML or JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TaskgraphError> {
        load_document(path.as_ref())
    }
}

/// Parameters of one decision run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Parameters {
    /// Project (branch) name.
    pub project: String,
    /// SCM level, `"1"` to `"3"`.
    pub level: String,
    /// Repository the push came from.
    pub head_repository: String,
    /// Revision being built.
    pub head_rev: String,
    /// Decision task of the run, once known.
    pub decision_task_id: Option<String>,
    /// Any other parameters.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            project: "try".to_string(),
            level: "1".to_string(),
            head_repository: String::new(),
            head_rev: String::new(),
            decision_task_id: None,
            extra: Map::new(),
        }
    }
}

impl Parameters {
    /// Creates parameters for a project.
    #[must_use]
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            ..Self::default()
        }
    }

    /// Sets the level.
    #[must_use]
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    /// Sets the decision task id.
    #[must_use]
    pub fn with_decision_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.decision_task_id = Some(task_id.into());
        self
    }

    /// Sets an extra parameter.
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Returns a parameter by name, typed fields first.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        match key {
            "project" => Some(Value::String(self.project.clone())),
            "level" => Some(Value::String(self.level.clone())),
            "head_repository" => Some(Value::String(self.head_repository.clone())),
            "head_rev" => Some(Value::String(self.head_rev.clone())),
            "decision_task_id" => self.decision_task_id.clone().map(Value::String),
            other => self.extra.get(other).cloned(),
        }
    }

    /// Returns every parameter as one JSON object.
    #[must_use]
    pub fn to_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    /// Loads a YAML or JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TaskgraphError> {
        load_document(path.as_ref())
    }
}

/// Reads a YAML (`.yml`, `.yaml`) or JSON document.
///
/// # Errors
///
/// Returns an IO error if the file cannot be read, or a parse error.
pub fn load_document<T: DeserializeOwned>(path: &Path) -> Result<T, TaskgraphError> {
    let text = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("yml" | "yaml") => Ok(serde_yaml::from_str(&text)?),
        Some("json") => Ok(serde_json::from_str(&text)?),
        _ => Err(ConfigurationError::new(format!(
            "unsupported configuration file '{}', expected .yml, .yaml or .json",
            path.display()
        ))
        .into()),
    }
}
