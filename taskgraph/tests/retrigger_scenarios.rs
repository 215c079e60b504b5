//! End-to-end scenarios: keyed-by generation, closure, reference resolution
//! and the retrigger actions against in-memory collaborators.

use pretty_assertions::assert_eq;
use serde_json::{json, Map};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use taskgraph::actions::{register_retrigger_actions, ActionInvocation, ActionOutcome, ActionRegistry, ActionRegistryBuilder, LoadedGraph};
use taskgraph::config::{GraphConfig, Parameters, SubmissionConfig};
use taskgraph::core::JobRecord;
use taskgraph::errors::{StructuralError, TaskgraphError};
use taskgraph::generator::{KindDefinition, TaskGraphGenerator};
use taskgraph::graph::{Edge, Graph, TaskGraph};
use taskgraph::parameterization::{resolve_task_references, resolve_timestamps};
use taskgraph::schema::resolve_keyed_by;
use taskgraph::stages::map_stage;
use taskgraph::testing::{
    assert_graph_consistent, assert_no_placeholders, assert_submitted_labels, mochitest_task, task_fixture,
    FlakySubmitter, GraphFixture, RecordingSubmitter, TestHarness, DECISION_TASK_ID,
};
use taskgraph::transforms::{ResolveKeyedByStage, TransformSequence};
use taskgraph::utils::{JitterStrategy, RetryConfig};

fn registry() -> Arc<ActionRegistry> {
    register_retrigger_actions(ActionRegistryBuilder::new()).build().unwrap()
}

/// `build` ran, `L` ran on top of it.
fn single_task_graph() -> LoadedGraph {
    GraphFixture::new()
        .executed(task_fixture("build", "build-linux64/opt", &[]), "BUILD")
        .executed(task_fixture("test", "L", &[("build", "build-linux64/opt")]), "L-ID")
        .build()
}

/// `L` ran, `M` depends on it and ran, `N` depends on it and was pruned.
fn downstream_graph() -> LoadedGraph {
    GraphFixture::new()
        .executed(task_fixture("build", "L", &[]), "L-ID")
        .executed(task_fixture("test", "M", &[("parent", "L")]), "M-ID")
        .pruned(task_fixture("test", "N", &[("parent", "L")]))
        .build()
}

#[test]
fn test_keyed_by_selects_platform_value() {
    let job = |platform: &str| {
        JobRecord::from_value(json!({
            "attributes": {"platform": platform},
            "config": {"by-platform": {"win64": "A", "default": "B"}},
        }))
        .unwrap()
    };

    let mut win = job("win64");
    resolve_keyed_by(&mut win, "config", "job", &Map::new()).unwrap();
    assert_eq!(win.get("config"), Some(&json!("A")));

    let mut linux = job("linux64");
    resolve_keyed_by(&mut linux, "config", "job", &Map::new()).unwrap();
    assert_eq!(linux.get("config"), Some(&json!("B")));

    let resolved = linux.clone();
    resolve_keyed_by(&mut linux, "config", "job", &Map::new()).unwrap();
    assert_eq!(linux, resolved);
}

#[test]
fn test_generated_graph_is_consistent() {
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
        .with_job("linux64", json!({"platform": "linux64"}))
        .with_job("win64", json!({"platform": "win64"}));

    let graph = TaskGraphGenerator::new(Parameters::new("try"), GraphConfig::default())
        .with_kind(kind, transforms)
        .generate()
        .unwrap();

    assert_graph_consistent(&graph);
    assert_eq!(graph.get("build-win64").unwrap().task["config"], "A");
    assert_eq!(graph.get("build-linux64").unwrap().task["config"], "B");
}

#[test]
fn test_closure_is_a_fixed_point() {
    let graph = downstream_graph().full_task_graph;
    let closure = graph.graph().transitive_closure(["M"], false).unwrap();
    assert_eq!(closure.nodes(), &BTreeSet::from(["L".to_string(), "M".to_string()]));

    let again = closure.transitive_closure(closure.nodes(), false).unwrap();
    assert_eq!(again, closure);

    let downstream = graph.graph().transitive_closure(["L"], true).unwrap();
    assert_eq!(downstream.nodes().len(), 3);
}

#[test]
fn test_closure_over_cycle_fails() {
    let nodes = BTreeSet::from(["a".to_string(), "b".to_string(), "c".to_string()]);
    let edges = BTreeSet::from([Edge::new("a", "b", "b"), Edge::new("b", "c", "c"), Edge::new("c", "a", "a")]);
    let graph = Graph::new(nodes, edges);

    assert!(matches!(graph.transitive_closure(["a"], false), Err(StructuralError::Cycle(_))));
}

#[test]
fn test_reference_resolution_is_total() {
    let loaded = single_task_graph();
    let now = taskgraph::utils::parse_timestamp("2024-03-01T00:00:00Z").unwrap();

    for task in loaded.full_task_graph.tasks() {
        let dependencies: BTreeMap<String, String> = task
            .dependencies
            .iter()
            .map(|(name, label)| (name.clone(), loaded.label_to_taskid[label].clone()))
            .collect();
        let resolved = resolve_task_references(&task.label, &task.task, &dependencies, "https://tc.test").unwrap();
        assert_no_placeholders(&resolve_timestamps(&now, &resolved).unwrap());
    }
}

#[tokio::test]
async fn test_retrigger_three_times() {
    let harness = TestHarness::new(single_task_graph());
    let invocation = harness.invocation_for("L");

    let outcome = registry()
        .dispatch("retrigger", &harness.services, &invocation, json!({"times": 3}))
        .await
        .unwrap();

    let ids = outcome.task_ids().to_vec();
    assert_eq!(ids, vec!["new-0000", "new-0001", "new-0002"]);
    assert_eq!(harness.submitter.len(), 3);
    for submission in harness.submitter.submissions() {
        assert_eq!(submission.label(), Some("L"));
        assert_ne!(submission.task_id, "L-ID");
        assert_eq!(submission.definition["dependencies"], json!(["BUILD"]));
        assert_eq!(submission.definition["payload"]["upstream"]["build"], "BUILD");
        assert_eq!(submission.definition["taskGroupId"], DECISION_TASK_ID);
        assert_no_placeholders(&submission.definition);
    }

    let combined = harness.artifacts.get("task-graph.json").unwrap();
    assert_eq!(
        combined["labels"]["L"],
        json!([
            {"task_id": "new-0000", "repetition": 0},
            {"task_id": "new-0001", "repetition": 1},
            {"task_id": "new-0002", "repetition": 2},
        ])
    );
    assert!(harness.artifacts.get("label-to-taskid-2.json").is_some());
}

#[tokio::test]
async fn test_retrigger_downstream_skips_pruned_tasks() {
    let harness = TestHarness::new(downstream_graph());
    let invocation = harness.invocation_for("L");

    registry()
        .invoke(
            "retrigger",
            "retrigger-task",
            &harness.services,
            &invocation,
            json!({"downstream": true}),
        )
        .await
        .unwrap();

    assert_submitted_labels(&harness.submitter, &["L", "M"]);
    let l = &harness.submitter.find_by_label("L")[0];
    let m = &harness.submitter.find_by_label("M")[0];
    assert_eq!(harness.submitter.task_ids(), vec![l.task_id.clone(), m.task_id.clone()]);
    assert_eq!(l.definition["dependencies"], json!([DECISION_TASK_ID]));
    assert_eq!(m.definition["dependencies"], json!([l.task_id]));
    assert_eq!(m.definition["payload"]["upstream"]["parent"], json!(l.task_id));
}

#[tokio::test]
async fn test_mochitest_environment_override_replaces_once() {
    let graph = GraphFixture::new()
        .executed(task_fixture("build", "build-linux64/opt", &[]), "BUILD")
        .executed(
            mochitest_task("test-linux64/opt-mochitest-1", &[("build", "build-linux64/opt")]),
            "TEST",
        )
        .build();
    let original_env = graph.full_task_graph.get("test-linux64/opt-mochitest-1").unwrap().task["payload"]["env"]
        .as_object()
        .cloned()
        .unwrap();
    let harness = TestHarness::new(graph);
    let invocation = harness.invocation_for("test-linux64/opt-mochitest-1");

    registry()
        .dispatch(
            "retrigger",
            &harness.services,
            &invocation,
            json!({"path": "dom/tests", "environment": {"MOZ_LOG": "cache:5"}}),
        )
        .await
        .unwrap();

    let env = harness.submitter.submissions()[0].definition["payload"]["env"]
        .as_object()
        .cloned()
        .unwrap();
    assert_eq!(env["MOZ_LOG"], "cache:5");
    for (key, value) in original_env.iter().filter(|(k, _)| *k != "MOZ_LOG") {
        assert_eq!(&env[key], value);
    }
    let keys: BTreeSet<&String> = env.keys().collect();
    let mut expected: BTreeSet<&String> = original_env.keys().collect();
    let custom = "CUSTOM_MACH_COMMAND".to_string();
    expected.insert(&custom);
    assert_eq!(keys, expected);
    assert!(env["CUSTOM_MACH_COMMAND"].as_str().unwrap().ends_with(" dom/tests"));
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let flaky = Arc::new(FlakySubmitter::new(2));
    let harness = TestHarness::with_submitter(
        single_task_graph(),
        Arc::clone(&flaky) as Arc<dyn taskgraph::actions::util::TaskSubmitter>,
        Arc::new(RecordingSubmitter::new()),
    );
    let graph_config = GraphConfig::default().with_submission(SubmissionConfig {
        max_concurrency: 4,
        retry: RetryConfig::new()
            .with_max_attempts(3)
            .with_base_delay_ms(1)
            .with_jitter(JitterStrategy::None),
    });
    let invocation = ActionInvocation::new(harness.parameters(), graph_config, DECISION_TASK_ID).with_task(
        "L-ID",
        harness.graph.full_task_graph.get("L").unwrap().task.clone(),
    );

    let outcome = registry()
        .dispatch("retrigger", &harness.services, &invocation, json!({}))
        .await
        .unwrap();

    assert_eq!(outcome, ActionOutcome::Submitted { task_ids: vec!["new-0000".to_string()] });
    assert_eq!(flaky.attempts(), 3);
    assert_eq!(flaky.accepted().len(), 1);
}

#[tokio::test]
async fn test_invalid_input_is_rejected_before_submission() {
    let harness = TestHarness::new(single_task_graph());
    let invocation = harness.invocation_for("L");

    let err = registry()
        .dispatch("retrigger", &harness.services, &invocation, json!({"times": 7}))
        .await
        .unwrap_err();

    assert!(matches!(err, TaskgraphError::Configuration(_)));
    assert!(err.to_string().contains("invalid input for action 'retrigger'"));
    assert_eq!(harness.loader.call_count(), 0);
    assert!(harness.submitter.is_empty());
}

#[test]
fn test_full_task_graph_round_trips_through_json() {
    let graph = downstream_graph().full_task_graph;
    let restored = TaskGraph::from_json(graph.to_json().unwrap()).unwrap();
    assert_eq!(restored.labels(), graph.labels());
    assert_eq!(restored.get("M").unwrap().dependencies, graph.get("M").unwrap().dependencies);
}
