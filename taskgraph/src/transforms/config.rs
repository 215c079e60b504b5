//! Per-run state handed to every stage of a transform sequence.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{GraphConfig, Parameters};
use crate::core::Task;

/// Configuration for one kind's transform run.
#[derive(Debug, Clone)]
pub struct TransformConfig {
    /// The kind being transformed.
    pub kind: String,
    /// Directory the kind was loaded from, if any.
    pub path: Option<PathBuf>,
    /// The kind's own configuration (`kind.yml`).
    pub config: Map<String, Value>,
    /// Run parameters.
    pub parameters: Arc<Parameters>,
    /// Repository-wide graph configuration.
    pub graph_config: Arc<GraphConfig>,
    /// Tasks of the kinds listed in `kind-dependencies`, by label.
    pub kind_dependencies_tasks: BTreeMap<String, Task>,
}

impl TransformConfig {
    /// Creates a config with default parameters and graph configuration.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            path: None,
            config: Map::new(),
            parameters: Arc::new(Parameters::default()),
            graph_config: Arc::new(GraphConfig::default()),
            kind_dependencies_tasks: BTreeMap::new(),
        }
    }

    /// Sets the kind directory.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Sets the kind configuration.
    #[must_use]
    pub fn with_config(mut self, config: Map<String, Value>) -> Self {
        self.config = config;
        self
    }

    /// Sets the parameters.
    #[must_use]
    pub fn with_parameters(mut self, parameters: Arc<Parameters>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Sets the graph configuration.
    #[must_use]
    pub fn with_graph_config(mut self, graph_config: Arc<GraphConfig>) -> Self {
        self.graph_config = graph_config;
        self
    }

    /// Sets the upstream tasks.
    #[must_use]
    pub fn with_kind_dependencies_tasks(mut self, tasks: impl IntoIterator<Item = Task>) -> Self {
        self.kind_dependencies_tasks = tasks.into_iter().map(|t| (t.label.clone(), t)).collect();
        self
    }
}
