//! Collaborators and helpers shared by actions: loading the executed graph,
//! planning new tasks against it, submitting them, and recording what was
//! created.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::PathBuf;
use tracing::{debug, info};

use super::context::ActionServices;
use crate::config::{GraphConfig, Parameters};
use crate::core::{Task, NO_LABEL};
use crate::errors::{ConfigurationError, ReferenceError, SubmissionError, TaskgraphError};
use crate::graph::TaskGraph;
use crate::parameterization::{resolve_timestamps, ReferenceResolver};
use crate::utils::{with_retry, IdGenerator};

/// File name of the full task graph artifact.
pub const FULL_TASK_GRAPH: &str = "full-task-graph.json";
/// File name of the label-to-identifier artifact.
pub const LABEL_TO_TASKID: &str = "label-to-taskid.json";
/// File name of the combined record written after a multi-run action.
pub const COMBINED_TASK_GRAPH: &str = "task-graph.json";

/// Names the per-repetition variant of an artifact, e.g. `to-run-2.json`.
#[must_use]
pub fn repetition_artifact(base: &str, repetition: usize) -> String {
    format!("{base}-{repetition}.json")
}

/// The executed graph of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedGraph {
    /// The decision task that generated the graph.
    pub decision_task_id: String,
    /// Every task of the run, before optimization.
    pub full_task_graph: TaskGraph,
    /// Identifiers of the tasks that were actually submitted.
    pub label_to_taskid: BTreeMap<String, String>,
}

/// Loads the executed graph of a run.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GraphLoader: Send + Sync {
    /// Fetches the full task graph and label mapping for `parameters`.
    async fn fetch_graph_and_labels(
        &self,
        parameters: &Parameters,
        graph_config: &GraphConfig,
    ) -> Result<LoadedGraph, TaskgraphError>;
}

/// Reads the graph artifacts from a directory.
#[derive(Debug, Clone)]
pub struct FsGraphLoader {
    dir: PathBuf,
}

impl FsGraphLoader {
    /// Creates a loader over `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl GraphLoader for FsGraphLoader {
    async fn fetch_graph_and_labels(
        &self,
        parameters: &Parameters,
        _graph_config: &GraphConfig,
    ) -> Result<LoadedGraph, TaskgraphError> {
        let decision_task_id = parameters
            .decision_task_id
            .clone()
            .ok_or_else(|| ConfigurationError::new("parameters have no decision task id").with_field("decision_task_id"))?;

        let graph_text = tokio::fs::read_to_string(self.dir.join(FULL_TASK_GRAPH)).await?;
        let full_task_graph = TaskGraph::from_json(serde_json::from_str(&graph_text)?)?;
        let labels_text = tokio::fs::read_to_string(self.dir.join(LABEL_TO_TASKID)).await?;
        let label_to_taskid = serde_json::from_str(&labels_text)?;

        debug!(dir = %self.dir.display(), tasks = full_task_graph.len(), "Loaded task graph");
        Ok(LoadedGraph {
            decision_task_id,
            full_task_graph,
            label_to_taskid,
        })
    }
}

/// Submits task definitions to the execution service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskSubmitter: Send + Sync {
    /// Creates `definition` under `task_id`. Submitting the same identifier
    /// twice must not create two tasks.
    async fn submit(&self, task_id: &str, definition: &Value, level: &str) -> Result<(), SubmissionError>;
}

/// Stores JSON artifacts of an action run.
pub trait ArtifactStore: Send + Sync {
    /// Writes `value` under `name`, replacing any previous content.
    fn write_json(&self, name: &str, value: &Value) -> Result<(), TaskgraphError>;

    /// Reads the artifact `name`.
    fn read_json(&self, name: &str) -> Result<Value, TaskgraphError>;
}

/// Artifacts as files in a directory.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    dir: PathBuf,
}

impl FsArtifactStore {
    /// Creates a store writing into `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ArtifactStore for FsArtifactStore {
    fn write_json(&self, name: &str, value: &Value) -> Result<(), TaskgraphError> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.dir.join(name), serde_json::to_string_pretty(value)?)?;
        Ok(())
    }

    fn read_json(&self, name: &str) -> Result<Value, TaskgraphError> {
        let text = fs::read_to_string(self.dir.join(name))?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Artifacts kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    entries: Mutex<BTreeMap<String, Value>>,
}

impl InMemoryArtifactStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the stored artifact names.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }

    /// Returns a copy of one artifact.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Value> {
        self.entries.lock().get(name).cloned()
    }
}

impl ArtifactStore for InMemoryArtifactStore {
    fn write_json(&self, name: &str, value: &Value) -> Result<(), TaskgraphError> {
        self.entries.lock().insert(name.to_string(), value.clone());
        Ok(())
    }

    fn read_json(&self, name: &str) -> Result<Value, TaskgraphError> {
        self.get(name)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no artifact named {name}")).into())
    }
}

/// Appends `task_ids` to the definition's `dependencies` list, skipping
/// identifiers already present.
///
/// # Errors
///
/// Returns a `ConfigurationError` if the definition is not a mapping or its
/// `dependencies` is not a list.
pub fn extend_dependencies<'a, I>(definition: &mut Value, label: &str, task_ids: I) -> Result<(), ConfigurationError>
where
    I: IntoIterator<Item = &'a String>,
{
    let malformed = || ConfigurationError::new("task definition must be a mapping").with_label(label);
    let list = definition
        .as_object_mut()
        .ok_or_else(malformed)?
        .entry("dependencies")
        .or_insert_with(|| Value::Array(Vec::new()))
        .as_array_mut()
        .ok_or_else(|| {
            ConfigurationError::new("dependencies must be a list of task ids")
                .with_label(label)
                .with_field("dependencies")
        })?;
    for id in task_ids {
        if !list.iter().any(|existing| existing.as_str() == Some(id.as_str())) {
            list.push(Value::String(id.clone()));
        }
    }
    Ok(())
}

/// A task ready for submission.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedTask {
    /// The new identifier.
    pub task_id: String,
    /// The task, with dependencies bound to identifiers and its definition
    /// resolved.
    pub task: Task,
}

/// One repetition of a multi-task action, planned before anything is
/// submitted.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionPlan {
    /// Zero-based repetition index.
    pub repetition: usize,
    /// The labels being re-run.
    pub to_run: BTreeSet<String>,
    /// Planned tasks by label.
    pub tasks: BTreeMap<String, PlannedTask>,
    /// Labels grouped into dependency waves.
    pub waves: Vec<Vec<String>>,
    /// The executed mapping updated with the new identifiers.
    pub label_to_taskid: BTreeMap<String, String>,
}

impl SubmissionPlan {
    /// The new identifiers in wave order.
    #[must_use]
    pub fn task_ids(&self) -> Vec<&str> {
        self.waves
            .iter()
            .flatten()
            .filter_map(|label| self.tasks.get(label))
            .map(|planned| planned.task_id.as_str())
            .collect()
    }

    /// Renders the planned tasks keyed by their new identifiers.
    ///
    /// # Errors
    ///
    /// Returns a JSON error if a task cannot be serialized.
    pub fn task_graph_json(&self) -> Result<Value, TaskgraphError> {
        let mut map = Map::new();
        for planned in self.tasks.values() {
            map.insert(planned.task_id.clone(), serde_json::to_value(&planned.task)?);
        }
        Ok(Value::Object(map))
    }

    /// Writes `task-graph-<i>.json`, `label-to-taskid-<i>.json` and
    /// `to-run-<i>.json`.
    ///
    /// # Errors
    ///
    /// Returns the first store error.
    pub fn write_records(&self, store: &dyn ArtifactStore) -> Result<(), TaskgraphError> {
        let i = self.repetition;
        store.write_json(&repetition_artifact("task-graph", i), &self.task_graph_json()?)?;
        store.write_json(
            &repetition_artifact("label-to-taskid", i),
            &serde_json::to_value(&self.label_to_taskid)?,
        )?;
        store.write_json(&repetition_artifact("to-run", i), &json!(self.to_run))?;
        Ok(())
    }
}

/// Plans a re-run of `to_run` against an executed graph.
///
/// Every label gets a fresh identifier. Dependencies inside `to_run` bind
/// to the new identifiers, the rest to the executed ones, and tasks left
/// without dependencies depend on the decision task.
///
/// # Errors
///
/// Returns a `StructuralError` for labels missing from the graph, a
/// `ReferenceError` for a dependency that was never executed or an
/// unresolvable placeholder, and a `ConfigurationError` for a malformed
/// definition.
pub fn plan_tasks(
    to_run: &BTreeSet<String>,
    loaded: &LoadedGraph,
    ids: &dyn IdGenerator,
    root_url: &str,
    repetition: usize,
) -> Result<SubmissionPlan, TaskgraphError> {
    let subgraph = loaded.full_task_graph.subgraph(to_run.iter().map(String::as_str))?;
    let waves = subgraph.graph().waves()?;
    let new_ids: BTreeMap<String, String> = to_run.iter().map(|label| (label.clone(), ids.generate())).collect();

    let mut tasks = BTreeMap::new();
    for (label, task_id) in &new_ids {
        let original = subgraph.require(label)?;
        let mut dependencies = BTreeMap::new();
        for (name, dependency) in &original.dependencies {
            let id = new_ids
                .get(dependency)
                .or_else(|| loaded.label_to_taskid.get(dependency))
                .ok_or_else(|| ReferenceError::MissingIdentifier {
                    label: label.clone(),
                    name: name.clone(),
                    dependency: dependency.clone(),
                })?;
            dependencies.insert(name.clone(), id.clone());
        }

        let mut definition = ReferenceResolver::new(label, &dependencies, root_url)
            .with_task_id(task_id)
            .with_decision_task_id(&loaded.decision_task_id)
            .resolve(&original.task)?;
        let bound: Vec<&String> = if dependencies.is_empty() {
            vec![&loaded.decision_task_id]
        } else {
            dependencies.values().collect()
        };
        extend_dependencies(&mut definition, label, bound)?;
        if let Some(map) = definition.as_object_mut() {
            map.insert("taskGroupId".to_string(), Value::String(loaded.decision_task_id.clone()));
        }

        let mut task = original.clone().with_task_id(task_id.clone());
        task.dependencies = dependencies;
        task.task = definition;
        tasks.insert(
            label.clone(),
            PlannedTask {
                task_id: task_id.clone(),
                task,
            },
        );
    }

    let mut label_to_taskid = loaded.label_to_taskid.clone();
    label_to_taskid.extend(new_ids);

    Ok(SubmissionPlan {
        repetition,
        to_run: to_run.clone(),
        tasks,
        waves,
        label_to_taskid,
    })
}

/// Resolves relative timestamps, stamps the scheduler and submits one task,
/// retrying transient failures.
///
/// # Errors
///
/// Returns a `SubmissionError` once retries are exhausted or on a
/// non-transient failure, and a timestamp or configuration error for a
/// malformed definition.
pub async fn create_task_from_def(
    services: &ActionServices,
    graph_config: &GraphConfig,
    task_id: &str,
    definition: &Value,
    level: &str,
) -> Result<(), TaskgraphError> {
    let mut definition = resolve_timestamps(&services.now(), definition)?;
    let label = definition
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .unwrap_or(NO_LABEL)
        .to_string();
    definition
        .as_object_mut()
        .ok_or_else(|| ConfigurationError::new("task definition must be a mapping").with_label(&label))?
        .insert(
            "schedulerId".to_string(),
            Value::String(format!("{}-level-{level}", graph_config.trust_domain)),
        );

    debug!(task_id, label = %label, "Submitting task");
    let submitter = &services.submitter;
    with_retry(&graph_config.submission.retry, task_id, SubmissionError::is_transient, || {
        submitter.submit(task_id, &definition, level)
    })
    .await
    .map_err(|e| e.with_label(&label))?;

    info!(task_id, label = %label, "Created task");
    Ok(())
}

/// Submits a plan wave by wave; tasks within a wave are submitted
/// concurrently up to `submission.max-concurrency`.
///
/// # Errors
///
/// Returns the first failure of a wave; later waves are not submitted.
pub async fn submit_plan(
    services: &ActionServices,
    graph_config: &GraphConfig,
    plan: &SubmissionPlan,
    level: &str,
) -> Result<Vec<String>, TaskgraphError> {
    let concurrency = graph_config.submission.max_concurrency.max(1);
    let mut submitted = Vec::with_capacity(plan.tasks.len());

    for wave in &plan.waves {
        let submissions: Vec<_> = wave
            .iter()
            .filter_map(|label| plan.tasks.get(label))
            .map(|planned| async move {
                create_task_from_def(services, graph_config, &planned.task_id, &planned.task.task, level)
                    .await
                    .map(|()| planned.task_id.clone())
            })
            .collect();
        let results: Vec<Result<String, TaskgraphError>> = stream::iter(submissions)
            .buffer_unordered(concurrency)
            .collect()
            .await;
        for result in results {
            submitted.push(result?);
        }
    }
    Ok(submitted)
}

/// Merges the partial records of `repetitions` runs into `task-graph.json`.
///
/// The result lists, per label, every new identifier with its repetition,
/// plus all new task definitions keyed by identifier.
///
/// # Errors
///
/// Returns a store error if a partial record is missing.
pub fn combine_task_graph_files(store: &dyn ArtifactStore, repetitions: usize) -> Result<Value, TaskgraphError> {
    let mut labels: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    let mut tasks = Map::new();

    for repetition in 0..repetitions {
        let partial = store.read_json(&repetition_artifact("task-graph", repetition))?;
        let Value::Object(entries) = partial else {
            return Err(ConfigurationError::new(format!("partial task graph {repetition} is not a mapping")).into());
        };
        for (task_id, task) in entries {
            let label = task.get("label").and_then(Value::as_str).unwrap_or(NO_LABEL);
            labels
                .entry(label.to_string())
                .or_default()
                .push(json!({"task_id": task_id, "repetition": repetition}));
            tasks.insert(task_id, task);
        }
    }

    let combined = json!({"labels": labels, "tasks": tasks});
    store.write_json(COMBINED_TASK_GRAPH, &combined)?;
    Ok(combined)
}
