//! What an action sees when it runs: the invocation and injected services.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::util::{ArtifactStore, GraphLoader, InMemoryArtifactStore, TaskSubmitter};
use crate::config::{GraphConfig, Parameters};
use crate::core::string_map;
use crate::errors::ConfigurationError;
use crate::utils::timestamps::{now_utc, Timestamp};
use crate::utils::{IdGenerator, SlugIdGenerator};

/// The ambient inputs of one action invocation.
#[derive(Debug, Clone)]
pub struct ActionInvocation {
    /// Parameters of the run the action belongs to.
    pub parameters: Arc<Parameters>,
    /// Graph configuration of that run.
    pub graph_config: Arc<GraphConfig>,
    /// The task group the action was triggered on.
    pub task_group_id: String,
    /// The task the action was triggered on, if any.
    pub task_id: Option<String>,
    /// That task's submitted definition.
    pub task: Option<Value>,
}

impl ActionInvocation {
    /// Creates a task-group invocation.
    #[must_use]
    pub fn new(parameters: Parameters, graph_config: GraphConfig, task_group_id: impl Into<String>) -> Self {
        Self {
            parameters: Arc::new(parameters),
            graph_config: Arc::new(graph_config),
            task_group_id: task_group_id.into(),
            task_id: None,
            task: None,
        }
    }

    /// Targets a specific task.
    #[must_use]
    pub fn with_task(mut self, task_id: impl Into<String>, task: Value) -> Self {
        self.task_id = Some(task_id.into());
        self.task = Some(task);
        self
    }

    /// The target task's `tags`, or `None` for a task-group invocation.
    #[must_use]
    pub fn task_tags(&self) -> Option<BTreeMap<String, String>> {
        self.task.as_ref().map(|task| string_map(task.get("tags")))
    }

    /// Returns the target task definition.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigurationError` for a task-group invocation.
    pub fn require_task(&self) -> Result<&Value, ConfigurationError> {
        self.task
            .as_ref()
            .ok_or_else(|| ConfigurationError::new("this action must be triggered on a task"))
    }

    /// Returns the target task's label (`metadata.name`).
    ///
    /// # Errors
    ///
    /// Returns a `ConfigurationError` if there is no task or it has no name.
    pub fn task_label(&self) -> Result<&str, ConfigurationError> {
        self.require_task()?
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .ok_or_else(|| ConfigurationError::new("task has no metadata.name").with_field("metadata.name"))
    }
}

type Clock = Arc<dyn Fn() -> Timestamp + Send + Sync>;

/// Collaborators injected into every action.
#[derive(Clone)]
pub struct ActionServices {
    /// Loads the executed graph of a run.
    pub loader: Arc<dyn GraphLoader>,
    /// Submits new tasks.
    pub submitter: Arc<dyn TaskSubmitter>,
    /// Mints task identifiers.
    pub ids: Arc<dyn IdGenerator>,
    /// Receives the partial and combined graph records.
    pub artifacts: Arc<dyn ArtifactStore>,
    clock: Clock,
}

impl ActionServices {
    /// Creates services with slug identifiers, an in-memory artifact store
    /// and the system clock.
    #[must_use]
    pub fn new(loader: Arc<dyn GraphLoader>, submitter: Arc<dyn TaskSubmitter>) -> Self {
        Self {
            loader,
            submitter,
            ids: Arc::new(SlugIdGenerator),
            artifacts: Arc::new(InMemoryArtifactStore::new()),
            clock: Arc::new(now_utc),
        }
    }

    /// Replaces the identifier generator.
    #[must_use]
    pub fn with_ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Replaces the artifact store.
    #[must_use]
    pub fn with_artifacts(mut self, artifacts: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = artifacts;
        self
    }

    /// Pins the clock, for reproducible timestamps.
    #[must_use]
    pub fn with_fixed_time(mut self, now: Timestamp) -> Self {
        self.clock = Arc::new(move || now);
        self
    }

    /// Returns the current time.
    #[must_use]
    pub fn now(&self) -> Timestamp {
        (self.clock)()
    }
}

impl fmt::Debug for ActionServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionServices").finish_non_exhaustive()
    }
}

/// What an action did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum ActionOutcome {
    /// New tasks were submitted.
    Submitted {
        /// Identifiers of the new tasks, in submission order.
        task_ids: Vec<String>,
    },
    /// The service refused the task; nothing was created.
    Rejected {
        /// The identifier the task would have had.
        task_id: String,
        /// The service's reason.
        reason: String,
    },
}

impl ActionOutcome {
    /// Returns the identifiers of the submitted tasks.
    #[must_use]
    pub fn task_ids(&self) -> &[String] {
        match self {
            Self::Submitted { task_ids } => task_ids,
            Self::Rejected { .. } => &[],
        }
    }
}
