//! The `retrigger` actions.
//!
//! Three callbacks share the name `retrigger`; callers pick the first whose
//! context matches the task:
//!
//! | callback              | applies to                        | order |
//! |-----------------------|-----------------------------------|-------|
//! | `retrigger-mochitest` | `test-type` mochitest or reftest  | 10    |
//! | `retrigger-decision`  | decision, action and cron tasks   | 11    |
//! | `retrigger-task`      | any task                          | 19    |

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

use super::context::{ActionInvocation, ActionOutcome, ActionServices};
use super::registry::{ActionCallback, ActionDescriptor, ActionRegistryBuilder};
use super::util::{combine_task_graph_files, create_task_from_def, extend_dependencies, plan_tasks, submit_plan, LoadedGraph};
use crate::core::Task;
use crate::errors::{ConfigurationError, ReferenceError, StructuralError, SubmissionErrorKind, TaskgraphError};
use crate::graph::TaskGraph;
use crate::parameterization::{relativize_datestamps, ReferenceResolver};
use crate::schema::Schema;

const NAME: &str = "retrigger";
const SYMBOL: &str = "rt";

/// Describes `retrigger-mochitest`.
#[must_use]
pub fn mochitest_retrigger_descriptor() -> ActionDescriptor {
    ActionDescriptor::new(NAME, "retrigger-mochitest", "Retrigger Mochitest/Reftest", SYMBOL)
        .with_description("Retriggers the specified mochitest/reftest job with additional options")
        .generic()
        .with_context([("test-type", "mochitest")])
        .with_context([("test-type", "reftest")])
        .with_order(10)
        .with_schema(Schema::new(json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "maxLength": 255,
                    "default": "",
                    "title": "Path name",
                    "description": "Path of test to retrigger",
                },
                "logLevel": {
                    "type": "string",
                    "enum": ["debug", "info", "warning", "error", "critical"],
                    "default": "debug",
                    "title": "Log level",
                    "description": "Log level for output (default is DEBUG, which is highest)",
                },
                "runUntilFail": {
                    "type": "boolean",
                    "default": true,
                    "title": "Run until failure",
                    "description": "Runs the specified set of tests repeatedly until failure (or 30 times)",
                },
                "repeat": {
                    "type": "integer",
                    "default": 30,
                    "minimum": 1,
                    "title": "Run tests N times",
                    "description": "Run tests repeatedly (usually used in conjunction with runUntilFail)",
                },
                "environment": {
                    "type": "object",
                    "default": {"MOZ_LOG": ""},
                    "title": "Extra environment variables",
                    "description": "Extra environment variables to use for this run",
                    "additionalProperties": {"type": "string"},
                },
                "preferences": {
                    "type": "object",
                    "default": {},
                    "title": "Extra gecko (about:config) preferences",
                    "description": "Extra gecko (about:config) preferences to use for this run",
                    "additionalProperties": {"type": "string"},
                },
            },
            "additionalProperties": false,
            "required": ["path"],
        })))
}

/// Describes `retrigger-decision`.
#[must_use]
pub fn decision_retrigger_descriptor() -> ActionDescriptor {
    ActionDescriptor::new(NAME, "retrigger-decision", "Retrigger", SYMBOL)
        .with_description(
            "Create a clone of the task (retriggering decision, action, and cron tasks requires special scopes).",
        )
        .with_context([("kind", "decision-task")])
        .with_context([("kind", "action-callback")])
        .with_context([("kind", "cron-task")])
        .with_order(11)
}

/// Describes `retrigger-task`, the fallback for any task.
#[must_use]
pub fn generic_retrigger_descriptor() -> ActionDescriptor {
    ActionDescriptor::new(NAME, "retrigger-task", "Retrigger", SYMBOL)
        .with_description("Create a clone of the task.")
        .generic()
        .with_context(Vec::<(String, String)>::new())
        .with_order(19)
        .with_schema(Schema::new(json!({
            "type": "object",
            "properties": {
                "downstream": {
                    "type": "boolean",
                    "description": "If true, downstream tasks from this one will be cloned as well. The dependencies will be updated to work with the new task at the root.",
                    "default": false,
                },
                "times": {
                    "type": "integer",
                    "default": 1,
                    "minimum": 1,
                    "maximum": 6,
                    "title": "Times",
                    "description": "How many times to run each task.",
                },
            },
        })))
}

/// Registers the three retrigger actions.
#[must_use]
pub fn register_retrigger_actions(builder: ActionRegistryBuilder) -> ActionRegistryBuilder {
    builder
        .register(mochitest_retrigger_descriptor(), MochitestRetrigger)
        .register(decision_retrigger_descriptor(), DecisionRetrigger)
        .register(generic_retrigger_descriptor(), GenericRetrigger)
}

/// Binds each symbolic dependency of `task` to its executed identifier.
fn executed_dependencies(task: &Task, loaded: &LoadedGraph) -> Result<BTreeMap<String, String>, ReferenceError> {
    task.dependencies
        .iter()
        .map(|(name, label)| {
            loaded
                .label_to_taskid
                .get(label)
                .map(|id| (name.clone(), id.clone()))
                .ok_or_else(|| ReferenceError::MissingIdentifier {
                    label: task.label.clone(),
                    name: name.clone(),
                    dependency: label.clone(),
                })
        })
        .collect()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MochitestInput {
    path: String,
    log_level: String,
    run_until_fail: bool,
    repeat: u64,
    environment: Map<String, Value>,
    preferences: Map<String, Value>,
}

fn as_text(value: &Value) -> String {
    value.as_str().map_or_else(|| value.to_string(), ToString::to_string)
}

/// Builds the `mach` invocation a custom mochitest run executes.
fn custom_mach_command(test_type: &str, env: &Map<String, Value>, input: &MochitestInput) -> Result<String, ConfigurationError> {
    let mut command = vec![test_type.to_string()];

    if let Some(flavor) = env.get("MOCHITEST_FLAVOR").and_then(Value::as_str).filter(|f| !f.is_empty()) {
        command.extend(["--keep-open=false".to_string(), "-f".to_string(), flavor.to_string()]);
    }

    let e10s = match env.get("ENABLE_E10S").and_then(Value::as_str) {
        Some(flag) => serde_json::from_str::<bool>(flag).map_err(|_| {
            ConfigurationError::new(format!("ENABLE_E10S must be true or false, not {flag:?}"))
                .with_field("payload.env.ENABLE_E10S")
        })?,
        None => true,
    };
    if !e10s {
        command.push("--disable-e10s".to_string());
    }

    command.push("--log-tbpl=-".to_string());
    command.push(format!("--log-tbpl-level={}", input.log_level));
    if input.run_until_fail {
        command.push("--run-until-failure".to_string());
    }
    if input.repeat > 0 {
        command.extend(["--repeat".to_string(), input.repeat.to_string()]);
    }
    for (key, value) in &input.preferences {
        command.extend(["--setpref".to_string(), format!("{key}={}", as_text(value))]);
    }
    command.push(input.path.clone());

    Ok(command.join(" "))
}

/// Rewrites a test definition to run a custom `mach` command.
fn apply_mochitest_overrides(
    definition: &mut Value,
    label: &str,
    test_type: &str,
    input: &MochitestInput,
) -> Result<(), ConfigurationError> {
    let field_error = |field: &str, message: &str| ConfigurationError::new(message).with_label(label).with_field(field);

    let payload = definition
        .get_mut("payload")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| field_error("payload", "must be a mapping"))?;
    payload
        .get_mut("command")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| field_error("payload.command", "must be a list"))?
        .push(json!("--no-run-tests"));

    let env = payload
        .entry("env")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or_else(|| field_error("payload.env", "must be a mapping"))?;
    let command = custom_mach_command(test_type, env, input).map_err(|e| e.with_label(label))?;
    env.insert("CUSTOM_MACH_COMMAND".to_string(), Value::String(command));
    for (key, value) in &input.environment {
        env.insert(key.clone(), Value::String(as_text(value)));
    }

    match definition.pointer_mut("/extra/treeherder/symbol") {
        Some(Value::String(symbol)) => symbol.push_str("-custom"),
        _ => return Err(field_error("extra.treeherder.symbol", "must be a string")),
    }
    Ok(())
}

/// Re-runs a mochitest or reftest with a custom command line.
#[derive(Debug, Clone, Copy, Default)]
pub struct MochitestRetrigger;

#[async_trait]
impl ActionCallback for MochitestRetrigger {
    async fn invoke(
        &self,
        services: &ActionServices,
        invocation: &ActionInvocation,
        input: Value,
    ) -> Result<ActionOutcome, TaskgraphError> {
        let input: MochitestInput = serde_json::from_value(input)?;
        let loaded = services
            .loader
            .fetch_graph_and_labels(&invocation.parameters, &invocation.graph_config)
            .await?;

        let name = invocation.task_label()?;
        let pre_task = loaded
            .full_task_graph
            .find_by_metadata_name(name)
            .ok_or_else(|| StructuralError::missing_label(name, "full task graph"))?;
        let test_type = invocation
            .task_tags()
            .and_then(|tags| tags.get("test-type").cloned())
            .ok_or_else(|| ConfigurationError::new("task has no test-type tag").with_label(name).with_field("tags.test-type"))?;

        let dependencies = executed_dependencies(pre_task, &loaded)?;
        let mut definition = ReferenceResolver::new(&pre_task.label, &dependencies, &invocation.graph_config.root_url)
            .with_decision_task_id(&loaded.decision_task_id)
            .resolve(&pre_task.task)?;
        extend_dependencies(&mut definition, &pre_task.label, dependencies.values())?;
        apply_mochitest_overrides(&mut definition, &pre_task.label, &test_type, &input)?;

        let task_id = services.ids.generate();
        info!(label = %pre_task.label, task_id = %task_id, "Retriggering with a custom command");
        create_task_from_def(
            services,
            &invocation.graph_config,
            &task_id,
            &definition,
            &invocation.parameters.level,
        )
        .await?;
        Ok(ActionOutcome::Submitted { task_ids: vec![task_id] })
    }
}

/// Resubmits a decision, action or cron task exactly as it ran.
///
/// Creating such tasks needs privileges the action may lack; a rejection is
/// reported as [`ActionOutcome::Rejected`] rather than an error.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecisionRetrigger;

#[async_trait]
impl ActionCallback for DecisionRetrigger {
    async fn invoke(
        &self,
        services: &ActionServices,
        invocation: &ActionInvocation,
        _input: Value,
    ) -> Result<ActionOutcome, TaskgraphError> {
        let definition = relativize_datestamps(invocation.require_task()?)?;
        let task_id = services.ids.generate();

        match create_task_from_def(
            services,
            &invocation.graph_config,
            &task_id,
            &definition,
            &invocation.parameters.level,
        )
        .await
        {
            Ok(()) => Ok(ActionOutcome::Submitted { task_ids: vec![task_id] }),
            Err(TaskgraphError::Submission(e)) if e.kind == SubmissionErrorKind::Rejected => {
                warn!(task_id = %task_id, reason = %e.message, "Retrigger was rejected");
                Ok(ActionOutcome::Rejected {
                    task_id,
                    reason: e.message,
                })
            }
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct GenericInput {
    #[serde(default)]
    downstream: bool,
    #[serde(default = "one")]
    times: usize,
}

const fn one() -> usize {
    1
}

/// Clones a task, optionally with everything downstream of it, one or more
/// times.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericRetrigger;

impl GenericRetrigger {
    async fn run_repetition(
        services: &ActionServices,
        invocation: &ActionInvocation,
        loaded: &LoadedGraph,
        to_run: &BTreeSet<String>,
        repetition: usize,
    ) -> Result<Vec<String>, TaskgraphError> {
        let plan = plan_tasks(
            to_run,
            loaded,
            services.ids.as_ref(),
            &invocation.graph_config.root_url,
            repetition,
        )?;
        plan.write_records(services.artifacts.as_ref())?;
        submit_plan(services, &invocation.graph_config, &plan, &invocation.parameters.level).await
    }
}

#[async_trait]
impl ActionCallback for GenericRetrigger {
    async fn invoke(
        &self,
        services: &ActionServices,
        invocation: &ActionInvocation,
        input: Value,
    ) -> Result<ActionOutcome, TaskgraphError> {
        let input: GenericInput = serde_json::from_value(input)?;
        let loaded = services
            .loader
            .fetch_graph_and_labels(&invocation.parameters, &invocation.graph_config)
            .await?;

        let label = invocation.task_label()?.to_string();
        loaded.full_task_graph.require(&label)?;

        let mut to_run = BTreeSet::from([label.clone()]);
        if input.downstream {
            let downstream = loaded
                .full_task_graph
                .graph()
                .transitive_closure([label.as_str()], true)?;
            to_run = TaskGraph::intersect_with_known(downstream.nodes(), &loaded.label_to_taskid);
            to_run.insert(label.clone());
        }

        let mut task_ids = Vec::new();
        for repetition in 0..input.times {
            let created = Self::run_repetition(services, invocation, &loaded, &to_run, repetition)
                .await
                .map_err(|e| e.with_repetition(repetition))?;
            info!(
                label = %label,
                downstream = input.downstream,
                time = repetition + 1,
                times = input.times,
                tasks = created.len(),
                "Scheduled retrigger"
            );
            task_ids.extend(created);
        }

        combine_task_graph_files(services.artifacts.as_ref(), input.times)?;
        Ok(ActionOutcome::Submitted { task_ids })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionRegistry;
    use crate::testing::{
        assert_no_placeholders, assert_submitted_labels, mochitest_task, task_fixture, GraphFixture,
        RecordingSubmitter, RejectingSubmitter, TestHarness,
    };
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn registry() -> Arc<ActionRegistry> {
        register_retrigger_actions(ActionRegistryBuilder::new()).build().unwrap()
    }

    fn mochitest_graph() -> LoadedGraph {
        GraphFixture::new()
            .executed(task_fixture("build", "build-linux64/opt", &[]), "BUILD")
            .executed(
                mochitest_task("test-linux64/opt-mochitest-1", &[("build", "build-linux64/opt")]),
                "TEST",
            )
            .build()
    }

    fn mochitest_input(extra: Value) -> MochitestInput {
        let schema = mochitest_retrigger_descriptor().schema.unwrap();
        serde_json::from_value(schema.validate_with_defaults(extra).unwrap()).unwrap()
    }

    #[test]
    fn test_custom_mach_command() {
        let env = json!({"MOCHITEST_FLAVOR": "plain", "ENABLE_E10S": "false"});
        let input = mochitest_input(json!({
            "path": "dom/tests",
            "logLevel": "info",
            "repeat": 5,
            "preferences": {"a.b": "1", "c.d": "x"},
        }));
        assert_eq!(
            custom_mach_command("mochitest", env.as_object().unwrap(), &input).unwrap(),
            "mochitest --keep-open=false -f plain --disable-e10s --log-tbpl=- --log-tbpl-level=info \
             --run-until-failure --repeat 5 --setpref a.b=1 --setpref c.d=x dom/tests"
        );
    }

    #[test]
    fn test_custom_mach_command_rejects_bad_e10s_flag() {
        let env = json!({"ENABLE_E10S": "maybe"});
        let input = mochitest_input(json!({"path": ""}));
        assert!(custom_mach_command("reftest", env.as_object().unwrap(), &input).is_err());
    }

    #[tokio::test]
    async fn test_mochitest_retrigger() {
        let harness = TestHarness::new(mochitest_graph());
        let invocation = harness.invocation_for("test-linux64/opt-mochitest-1");

        let outcome = registry()
            .dispatch(
                "retrigger",
                &harness.services,
                &invocation,
                json!({"path": "browser/base", "environment": {"MOZ_LOG": "cache:5", "EXTRA": "1"}}),
            )
            .await
            .unwrap();
        assert_eq!(outcome.task_ids(), ["new-0000".to_string()]);

        let submissions = harness.submitter.submissions();
        assert_eq!(submissions.len(), 1);
        let definition = &submissions[0].definition;
        assert_no_placeholders(definition);
        assert_eq!(submissions[0].level, "3");
        assert_eq!(definition["payload"]["upstream"]["build"], "BUILD");
        assert_eq!(definition["dependencies"], json!(["BUILD"]));
        assert_eq!(
            definition["payload"]["command"],
            json!(["run-tests", "--suite=mochitest", "--no-run-tests"])
        );
        assert_eq!(definition["extra"]["treeherder"]["symbol"], "M1-custom");
        assert_eq!(definition["schedulerId"], "gecko-level-3");

        let env = definition["payload"]["env"].as_object().unwrap();
        assert_eq!(env["MOZ_LOG"], "cache:5");
        assert_eq!(env["EXTRA"], "1");
        assert_eq!(env["MOCHITEST_FLAVOR"], "browser-chrome");
        assert_eq!(env.keys().filter(|k| *k == "MOZ_LOG").count(), 1);
        assert!(env["CUSTOM_MACH_COMMAND"]
            .as_str()
            .unwrap()
            .starts_with("mochitest --keep-open=false -f browser-chrome --log-tbpl=-"));
    }

    #[tokio::test]
    async fn test_mochitest_retrigger_requires_executed_dependencies() {
        let graph = GraphFixture::new()
            .pruned(task_fixture("build", "build-linux64/opt", &[]))
            .executed(
                mochitest_task("test-linux64/opt-mochitest-1", &[("build", "build-linux64/opt")]),
                "TEST",
            )
            .build();
        let harness = TestHarness::new(graph);
        let invocation = harness.invocation_for("test-linux64/opt-mochitest-1");

        let err = registry()
            .invoke("retrigger", "retrigger-mochitest", &harness.services, &invocation, json!({"path": ""}))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskgraphError::Reference(ReferenceError::MissingIdentifier { .. })));
        assert!(harness.submitter.is_empty());
    }

    fn decision_invocation(harness: &TestHarness) -> ActionInvocation {
        ActionInvocation::new(harness.parameters(), crate::config::GraphConfig::default(), "GROUP").with_task(
            "DECISION",
            json!({
                "metadata": {"name": "Gecko Decision Task"},
                "created": "2024-01-01T00:00:00.000Z",
                "deadline": "2024-01-02T00:00:00.000Z",
                "tags": {"kind": "decision-task"},
                "payload": {"command": ["decide"]},
            }),
        )
    }

    #[tokio::test]
    async fn test_decision_retrigger_relativizes_timestamps() {
        let harness = TestHarness::new(GraphFixture::new().build());
        let invocation = decision_invocation(&harness);

        let outcome = registry()
            .dispatch("retrigger", &harness.services, &invocation, Value::Null)
            .await
            .unwrap();
        assert_eq!(outcome.task_ids(), ["new-0000".to_string()]);

        let submitted = &harness.submitter.submissions()[0].definition;
        assert_eq!(submitted["created"], "2024-03-01T00:00:00.000Z");
        assert_eq!(submitted["deadline"], "2024-03-02T00:00:00.000Z");
        assert_eq!(harness.loader.call_count(), 0);
    }

    #[tokio::test]
    async fn test_decision_retrigger_rejection_is_reported() {
        let graph = GraphFixture::new().build();
        let harness = TestHarness::with_submitter(
            graph,
            Arc::new(RejectingSubmitter::new("missing scopes")),
            Arc::new(RecordingSubmitter::new()),
        );
        let invocation = decision_invocation(&harness);

        let outcome = registry()
            .invoke("retrigger", "retrigger-decision", &harness.services, &invocation, Value::Null)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ActionOutcome::Rejected {
                task_id: "new-0000".to_string(),
                reason: "missing scopes".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_generic_retrigger_is_selected_for_other_tasks() {
        let harness = TestHarness::new(
            GraphFixture::new()
                .executed(task_fixture("build", "build-linux64/opt", &[]), "BUILD")
                .build(),
        );
        let invocation = harness.invocation_for("build-linux64/opt");

        registry()
            .dispatch("retrigger", &harness.services, &invocation, json!({}))
            .await
            .unwrap();
        assert_submitted_labels(&harness.submitter, &["build-linux64/opt"]);
        assert!(harness.artifacts.get("task-graph.json").is_some());
    }

    #[tokio::test]
    async fn test_generic_retrigger_reports_repetition() {
        let harness = TestHarness::new(
            GraphFixture::new()
                .pruned(task_fixture("build", "build", &[]))
                .executed(task_fixture("test", "test", &[("build", "build")]), "TEST")
                .build(),
        );
        let invocation = harness.invocation_for("test");

        let err = registry()
            .invoke("retrigger", "retrigger-task", &harness.services, &invocation, json!({"times": 2}))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskgraphError::Repetition { repetition: 0, .. }));
        assert!(matches!(err.root(), TaskgraphError::Reference(_)));
        assert!(harness.submitter.is_empty());
    }
}
