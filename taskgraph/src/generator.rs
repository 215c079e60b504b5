//! Kind loading and full task graph generation.
//!
//! Each kind is a directory holding a `kind.yml` definition. Kinds run in
//! `kind-dependencies` order; every kind sees the tasks produced by the
//! kinds it depends on through
//! [`TransformConfig::kind_dependencies_tasks`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{load_document, GraphConfig, Parameters};
use crate::core::{JobRecord, Task};
use crate::errors::{ConfigurationError, StructuralError, TaskgraphError};
use crate::graph::validation::{validate_dag, Adjacency};
use crate::graph::TaskGraph;
use crate::transforms::{TransformConfig, TransformSequence};

/// File name of a kind definition inside its directory.
pub const KIND_FILE: &str = "kind.yml";

/// How a kind produces its initial job records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoaderKind {
    /// One record per entry of `jobs`, merged over `job-defaults`.
    #[default]
    Jobs,
    /// One record per upstream task, carried under `dependent-task`.
    SingleDep,
}

/// A kind definition as read from `kind.yml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct KindDefinition {
    /// The kind name (the directory name).
    #[serde(skip)]
    pub name: String,
    /// Kinds whose tasks this kind consumes.
    pub kind_dependencies: Vec<String>,
    /// Defaults merged under every job.
    pub job_defaults: Map<String, Value>,
    /// Job descriptions by name.
    pub jobs: Map<String, Value>,
    /// Record loader.
    pub loader: LoaderKind,
    /// For `single-dep`: only upstream tasks with all these attributes set.
    pub only_for_attributes: Vec<String>,
    /// Everything else in `kind.yml`, handed to the transforms.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl KindDefinition {
    /// Creates an empty `jobs` kind.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Adds a kind dependency.
    #[must_use]
    pub fn with_kind_dependency(mut self, kind: impl Into<String>) -> Self {
        self.kind_dependencies.push(kind.into());
        self
    }

    /// Sets the job defaults.
    #[must_use]
    pub fn with_job_defaults(mut self, defaults: Map<String, Value>) -> Self {
        self.job_defaults = defaults;
        self
    }

    /// Adds a job description.
    #[must_use]
    pub fn with_job(mut self, name: impl Into<String>, job: Value) -> Self {
        self.jobs.insert(name.into(), job);
        self
    }

    /// Sets the loader.
    #[must_use]
    pub fn with_loader(mut self, loader: LoaderKind) -> Self {
        self.loader = loader;
        self
    }

    /// Restricts a `single-dep` kind to upstream tasks carrying `attribute`.
    #[must_use]
    pub fn with_only_for_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.only_for_attributes.push(attribute.into());
        self
    }

    /// Loads `<dir>/kind.yml`, naming the kind after the directory.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file is missing, or a YAML error if it
    /// is malformed.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, TaskgraphError> {
        let dir = dir.as_ref();
        let name = dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ConfigurationError::new(format!("kind directory {} has no name", dir.display())))?;
        let mut definition: Self = load_document(&dir.join(KIND_FILE))?;
        definition.name = name.to_string();
        Ok(definition)
    }

    /// Produces the initial job records for this kind.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigurationError` for a job that is not a mapping.
    pub fn load_jobs(&self, upstream: &BTreeMap<String, Task>) -> Result<Vec<JobRecord>, TaskgraphError> {
        match self.loader {
            LoaderKind::Jobs => self
                .jobs
                .iter()
                .map(|(name, job)| -> Result<JobRecord, TaskgraphError> {
                    let mut record = JobRecord::from_value(job.clone())
                        .map_err(|e| e.with_kind(&self.name).with_label(name))?
                        .merge_defaults(&self.job_defaults);
                    if !record.contains("name") {
                        record.set("name", Value::String(name.clone()))?;
                    }
                    Ok(record)
                })
                .collect(),
            LoaderKind::SingleDep => upstream
                .values()
                .filter(|task| {
                    self.only_for_attributes
                        .iter()
                        .all(|attr| task.attributes.get(attr).is_some_and(is_truthy))
                })
                .map(|task| -> Result<JobRecord, TaskgraphError> {
                    let mut record = JobRecord::from(self.job_defaults.clone());
                    record.set("dependent-task", serde_json::to_value(task)?)?;
                    Ok(record)
                })
                .collect(),
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Loads every `<root>/<kind>/kind.yml`, sorted by kind name.
///
/// # Errors
///
/// Returns the first load error.
pub fn load_kinds(root: impl AsRef<Path>) -> Result<Vec<KindDefinition>, TaskgraphError> {
    let mut dirs: Vec<PathBuf> = Vec::new();
    for entry in fs::read_dir(root.as_ref())? {
        let path = entry?.path();
        if path.join(KIND_FILE).is_file() {
            dirs.push(path);
        }
    }
    dirs.sort();
    dirs.iter().map(KindDefinition::load).collect()
}

#[derive(Debug)]
struct Kind {
    definition: KindDefinition,
    transforms: TransformSequence,
}

/// Builds the full task graph from a set of kinds.
#[derive(Debug)]
pub struct TaskGraphGenerator {
    parameters: Arc<Parameters>,
    graph_config: Arc<GraphConfig>,
    kinds: BTreeMap<String, Kind>,
}

impl TaskGraphGenerator {
    /// Creates a generator with no kinds.
    #[must_use]
    pub fn new(parameters: Parameters, graph_config: GraphConfig) -> Self {
        Self {
            parameters: Arc::new(parameters),
            graph_config: Arc::new(graph_config),
            kinds: BTreeMap::new(),
        }
    }

    /// Adds a kind and the transforms that turn its jobs into tasks. A kind
    /// with the same name is replaced.
    #[must_use]
    pub fn with_kind(mut self, definition: KindDefinition, transforms: TransformSequence) -> Self {
        self.kinds.insert(
            definition.name.clone(),
            Kind {
                definition,
                transforms,
            },
        );
        self
    }

    /// Returns the kind names in the order they will run.
    ///
    /// # Errors
    ///
    /// Returns `StructuralError::UnknownKind` for a dependency on a missing
    /// kind and `StructuralError::Cycle` for cyclic kind dependencies.
    pub fn kind_order(&self) -> Result<Vec<String>, StructuralError> {
        let mut adjacency = Adjacency::new();
        for (name, kind) in &self.kinds {
            let deps: BTreeSet<String> = kind.definition.kind_dependencies.iter().cloned().collect();
            if let Some(missing) = deps.iter().find(|dep| !self.kinds.contains_key(*dep)) {
                return Err(StructuralError::UnknownKind {
                    kind: name.clone(),
                    dependency: missing.clone(),
                });
            }
            adjacency.insert(name.clone(), deps);
        }
        Ok(validate_dag(&adjacency)?)
    }

    /// Runs every kind and builds the full task graph.
    ///
    /// # Errors
    ///
    /// Returns the first configuration error raised by a loader or
    /// transform, or a structural error if the tasks do not form a graph.
    #[tracing::instrument(skip(self), fields(project = %self.parameters.project))]
    pub fn generate(&self) -> Result<TaskGraph, TaskgraphError> {
        let order = self.kind_order()?;
        let mut by_kind: BTreeMap<&str, Vec<Task>> = BTreeMap::new();

        for name in &order {
            let Some(kind) = self.kinds.get(name) else {
                continue;
            };
            let upstream: BTreeMap<String, Task> = kind
                .definition
                .kind_dependencies
                .iter()
                .filter_map(|dep| by_kind.get(dep.as_str()))
                .flatten()
                .map(|task| (task.label.clone(), task.clone()))
                .collect();

            let jobs = kind.definition.load_jobs(&upstream)?;
            debug!(kind = %name, jobs = jobs.len(), "Loaded jobs");

            let config = TransformConfig::new(name.clone())
                .with_config(kind.definition.extra.clone())
                .with_parameters(Arc::clone(&self.parameters))
                .with_graph_config(Arc::clone(&self.graph_config))
                .with_kind_dependencies_tasks(upstream.into_values());
            let tasks = kind.transforms.run(&config, jobs)?;
            by_kind.insert(name.as_str(), tasks);
        }

        let graph = TaskGraph::build(by_kind.into_values().flatten())?;
        info!(kinds = order.len(), tasks = graph.len(), "Generated full task graph");
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::map_stage;
    use crate::transforms::{CopyDependentAttributes, ResolveKeyedByStage};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn build_transforms() -> TransformSequence {
        TransformSequence::new()
            .with_stage(ResolveKeyedByStage::new(["worker-type"]))
            .with_stage(map_stage("label", |config, mut job| {
                let name = job.best_label();
                job.set("label", json!(format!("{}-{name}", config.kind)))?;
                job.set("payload.command", json!(["build"]))?;
                Ok(job)
            }))
    }

    fn test_transforms() -> TransformSequence {
        TransformSequence::new()
            .with_stage(CopyDependentAttributes::new().with_key("shippable"))
            .with_stage(map_stage("from-dep", |_config, mut job| {
                let upstream = job.get_str("dependent-task.label").unwrap_or_default().to_string();
                job.set("label", json!(format!("test-{upstream}")))?;
                job.set("dependencies.build", json!(upstream))?;
                job.set("payload.command", json!(["test"]))?;
                Ok(job)
            }))
    }

    fn build_kind() -> KindDefinition {
        KindDefinition::new("build")
            .with_job_defaults(
                json!({"worker-type": {"by-platform": {"win.*": "b-win", "default": "b-linux"}}})
                    .as_object()
                    .cloned()
                    .unwrap(),
            )
            .with_job("linux64", json!({"platform": "linux64", "attributes": {"shippable": true}}))
            .with_job("win64", json!({"platform": "win64", "attributes": {"shippable": false}}))
    }

    fn test_kind() -> KindDefinition {
        KindDefinition::new("test")
            .with_kind_dependency("build")
            .with_loader(LoaderKind::SingleDep)
            .with_only_for_attribute("shippable")
            .with_job_defaults(json!({"worker-type": "t-linux"}).as_object().cloned().unwrap())
    }

    #[test]
    fn test_generate_runs_kinds_in_dependency_order() {
        let generator = TaskGraphGenerator::new(Parameters::default(), GraphConfig::default())
            .with_kind(test_kind(), test_transforms())
            .with_kind(build_kind(), build_transforms());

        assert_eq!(generator.kind_order().unwrap(), vec!["build", "test"]);

        let graph = generator.generate().unwrap();
        assert_eq!(graph.labels(), vec!["build-linux64", "build-win64", "test-build-linux64"]);
        assert_eq!(graph.get("build-win64").unwrap().task["worker-type"], "b-win");
        assert_eq!(graph.get("build-linux64").unwrap().task["worker-type"], "b-linux");

        let test = graph.get("test-build-linux64").unwrap();
        assert_eq!(test.dependencies["build"], "build-linux64");
        assert_eq!(test.attributes["kind"], "test");
        assert_eq!(test.attributes["shippable"], true);
    }

    #[test]
    fn test_unknown_kind_dependency() {
        let generator = TaskGraphGenerator::new(Parameters::default(), GraphConfig::default())
            .with_kind(test_kind(), test_transforms());
        let err = generator.generate().unwrap_err();
        assert_eq!(err.to_string(), "Kind 'test' depends on unknown kind 'build'");
    }

    #[test]
    fn test_cyclic_kinds() {
        let generator = TaskGraphGenerator::new(Parameters::default(), GraphConfig::default())
            .with_kind(KindDefinition::new("a").with_kind_dependency("b"), TransformSequence::new())
            .with_kind(KindDefinition::new("b").with_kind_dependency("a"), TransformSequence::new());
        assert!(matches!(generator.kind_order(), Err(StructuralError::Cycle(_))));
    }

    #[test]
    fn test_jobs_loader_merges_defaults_and_names() {
        let kind = KindDefinition::new("k")
            .with_job_defaults(json!({"run": {"using": "mach"}, "tags": ["a"]}).as_object().cloned().unwrap())
            .with_job("one", json!({"tags": ["b"]}));
        let jobs = kind.load_jobs(&BTreeMap::new()).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(
            jobs[0].clone().into_value(),
            json!({"run": {"using": "mach"}, "tags": ["a", "b"], "name": "one"})
        );
    }

    fn generate_config(job: Value) -> Value {
        let transforms = TransformSequence::new()
            .with_stage(ResolveKeyedByStage::new(["config"]))
            .with_stage(map_stage("describe", |config, mut job| {
                let label = format!("{}-{}", config.kind, job.best_label());
                job.set("label", json!(label))?;
                job.set("worker-type", json!("b-linux"))?;
                job.set("payload.command", json!(["build"]))?;
                Ok(job)
            }));
        let kind = KindDefinition::new("build")
            .with_job_defaults(
                json!({"config": {"by-platform": {"win64": "A", "default": "B"}}})
                    .as_object()
                    .cloned()
                    .unwrap(),
            )
            .with_job("job", job);

        let graph = TaskGraphGenerator::new(Parameters::new("try"), GraphConfig::default())
            .with_kind(kind, transforms)
            .generate()
            .unwrap();
        graph.get("build-job").unwrap().task["config"].clone()
    }

    #[test]
    fn test_job_keyed_by_replaces_keyed_by_default() {
        let by_project = generate_config(json!({
            "platform": "win64",
            "config": {"by-project": {"try": "T", "default": "D"}},
        }));
        assert_eq!(by_project, json!("T"));

        let narrowed = generate_config(json!({
            "platform": "win64",
            "config": {"by-platform": {"mac": "M", "default": "N"}},
        }));
        assert_eq!(narrowed, json!("N"));
    }

    #[test]
    fn test_job_literal_replaces_keyed_by_default() {
        assert_eq!(generate_config(json!({"platform": "win64", "config": "L"})), json!("L"));
        assert_eq!(generate_config(json!({"platform": "win64"})), json!("A"));
    }

    #[test]
    fn test_load_kinds_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_kinds(dir.path().join("absent")).unwrap_err();
        assert!(matches!(err, TaskgraphError::Io(_)));
    }

    #[test]
    fn test_jobs_loader_rejects_non_mapping() {
        let kind = KindDefinition::new("k").with_job("bad", json!(3));
        let err = kind.load_jobs(&BTreeMap::new()).unwrap_err();
        assert!(matches!(err, TaskgraphError::Configuration(ref e) if e.label.as_deref() == Some("bad")));
    }

    #[test]
    fn test_load_kinds_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        let build = dir.path().join("build");
        fs::create_dir(&build).unwrap();
        fs::write(
            build.join(KIND_FILE),
            "job-defaults:\n  worker-type: b-linux\njobs:\n  linux64:\n    platform: linux64\ntransforms:\n  - build\n",
        )
        .unwrap();
        let test = dir.path().join("test");
        fs::create_dir(&test).unwrap();
        fs::write(test.join(KIND_FILE), "kind-dependencies: [build]\nloader: single-dep\n").unwrap();
        fs::create_dir(dir.path().join("not-a-kind")).unwrap();

        let kinds = load_kinds(dir.path()).unwrap();
        assert_eq!(kinds.len(), 2);
        assert_eq!(kinds[0].name, "build");
        assert_eq!(kinds[0].jobs["linux64"]["platform"], "linux64");
        assert_eq!(kinds[0].extra["transforms"], json!(["build"]));
        assert_eq!(kinds[1].loader, LoaderKind::SingleDep);
        assert_eq!(kinds[1].kind_dependencies, vec!["build"]);
    }
}
