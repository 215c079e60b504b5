//! Fixture builders for graphs and action runs.

use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::mocks::{InMemoryGraphLoader, RecordingSubmitter};
use crate::actions::util::{InMemoryArtifactStore, LoadedGraph, TaskSubmitter};
use crate::actions::{ActionInvocation, ActionServices};
use crate::config::{GraphConfig, Parameters};
use crate::core::Task;
use crate::graph::TaskGraph;
use crate::utils::timestamps::{parse_timestamp, Timestamp};
use crate::utils::SequentialIdGenerator;

/// Decision task id used by [`GraphFixture`] unless overridden.
pub const DECISION_TASK_ID: &str = "DECISION";

/// Builds a task whose definition has the usual shape: metadata, relative
/// timestamps, a payload referencing each dependency, tags and a
/// treeherder symbol.
#[must_use]
pub fn task_fixture(kind: &str, label: &str, dependencies: &[(&str, &str)]) -> Task {
    let upstream: Map<String, Value> = dependencies
        .iter()
        .map(|(name, _)| ((*name).to_string(), json!({"task-reference": format!("<{name}>")})))
        .collect();
    let definition = json!({
        "metadata": {"name": label},
        "created": {"relative-datestamp": "0 seconds"},
        "deadline": {"relative-datestamp": "1 day"},
        "worker-type": "t-linux",
        "payload": {"command": ["run-task"], "env": {}, "upstream": upstream},
        "tags": {"kind": kind},
        "extra": {"treeherder": {"symbol": "B"}},
    });
    dependencies.iter().fold(
        Task::new(kind, label, definition).with_attribute("kind", json!(kind)),
        |task, (name, dep)| task.with_dependency(*name, *dep),
    )
}

/// Builds a mochitest task with a flavor, e10s enabled and a `MOZ_LOG`
/// environment entry.
#[must_use]
pub fn mochitest_task(label: &str, dependencies: &[(&str, &str)]) -> Task {
    let mut task = task_fixture("test", label, dependencies);
    task.task["tags"]["test-type"] = json!("mochitest");
    task.task["payload"]["command"] = json!(["run-tests", "--suite=mochitest"]);
    task.task["payload"]["env"] = json!({
        "MOCHITEST_FLAVOR": "browser-chrome",
        "ENABLE_E10S": "true",
        "MOZ_LOG": "nsHttp:1",
    });
    task.task["extra"]["treeherder"]["symbol"] = json!("M1");
    task
}

/// Builds an executed graph: tasks plus the identifiers of those that ran.
#[derive(Debug, Default)]
pub struct GraphFixture {
    tasks: Vec<Task>,
    label_to_taskid: BTreeMap<String, String>,
    decision_task_id: Option<String>,
}

impl GraphFixture {
    /// Creates an empty fixture.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a task that ran under `task_id`.
    #[must_use]
    pub fn executed(mut self, task: Task, task_id: impl Into<String>) -> Self {
        self.label_to_taskid.insert(task.label.clone(), task_id.into());
        self.tasks.push(task);
        self
    }

    /// Adds a task that was optimized away.
    #[must_use]
    pub fn pruned(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    /// Overrides the decision task id.
    #[must_use]
    pub fn with_decision_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.decision_task_id = Some(task_id.into());
        self
    }

    /// Builds the graph.
    ///
    /// # Panics
    ///
    /// Panics if the tasks do not form a valid graph.
    #[must_use]
    pub fn build(self) -> LoadedGraph {
        LoadedGraph {
            decision_task_id: self.decision_task_id.unwrap_or_else(|| DECISION_TASK_ID.to_string()),
            full_task_graph: TaskGraph::build(self.tasks).expect("fixture tasks form a graph"),
            label_to_taskid: self.label_to_taskid,
        }
    }
}

/// Services wired to in-memory collaborators, with handles for inspection.
pub struct TestHarness {
    /// The services to hand to actions.
    pub services: ActionServices,
    /// The graph served by the loader.
    pub graph: LoadedGraph,
    /// The loader.
    pub loader: Arc<InMemoryGraphLoader>,
    /// Receives submissions, unless replaced.
    pub submitter: Arc<RecordingSubmitter>,
    /// Receives artifacts.
    pub artifacts: Arc<InMemoryArtifactStore>,
    /// Mints `new-0000`, `new-0001`, ...
    pub ids: Arc<SequentialIdGenerator>,
    /// The pinned clock.
    pub now: Timestamp,
}

impl TestHarness {
    /// Creates a harness serving `graph` and recording submissions.
    #[must_use]
    pub fn new(graph: LoadedGraph) -> Self {
        let submitter = Arc::new(RecordingSubmitter::new());
        Self::with_submitter(graph, Arc::clone(&submitter) as Arc<dyn TaskSubmitter>, submitter)
    }

    /// Creates a harness whose services submit through `submitter`.
    #[must_use]
    pub fn with_submitter(
        graph: LoadedGraph,
        submitter: Arc<dyn TaskSubmitter>,
        recording: Arc<RecordingSubmitter>,
    ) -> Self {
        let now = parse_timestamp("2024-03-01T00:00:00Z").expect("valid timestamp");
        let loader = Arc::new(InMemoryGraphLoader::new(graph.clone()));
        let artifacts = Arc::new(InMemoryArtifactStore::new());
        let ids = Arc::new(SequentialIdGenerator::new("new"));
        let services = ActionServices::new(Arc::clone(&loader) as Arc<dyn crate::actions::util::GraphLoader>, submitter)
            .with_ids(Arc::clone(&ids) as Arc<dyn crate::utils::slugid::IdGenerator>)
            .with_artifacts(Arc::clone(&artifacts) as Arc<dyn crate::actions::util::ArtifactStore>)
            .with_fixed_time(now);
        Self {
            services,
            graph,
            loader,
            submitter: recording,
            artifacts,
            ids,
            now,
        }
    }

    /// Builds the parameters of the fixture run.
    #[must_use]
    pub fn parameters(&self) -> Parameters {
        Parameters::new("try")
            .with_level("3")
            .with_decision_task_id(self.graph.decision_task_id.clone())
    }

    /// Builds an invocation targeting the executed task `label`.
    ///
    /// # Panics
    ///
    /// Panics if `label` is not in the graph.
    #[must_use]
    pub fn invocation_for(&self, label: &str) -> ActionInvocation {
        let task = self
            .graph
            .full_task_graph
            .get(label)
            .unwrap_or_else(|| panic!("no task labelled {label}"));
        let task_id = self
            .graph
            .label_to_taskid
            .get(label)
            .cloned()
            .unwrap_or_else(|| format!("{label}-id"));
        ActionInvocation::new(self.parameters(), GraphConfig::default(), self.graph.decision_task_id.clone())
            .with_task(task_id, task.task.clone())
    }
}
