//! The action catalog.
//!
//! Actions are registered into an [`ActionRegistryBuilder`], frozen into an
//! [`ActionRegistry`] and shared behind an `Arc`. Several descriptors may
//! share a name; they differ by callback name, context and order, and the
//! caller picks the first one that applies to its task.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::info;

use super::context::{ActionInvocation, ActionOutcome, ActionServices};
use crate::config::Parameters;
use crate::errors::{ConfigurationError, TaskgraphError};
use crate::schema::{violations_error, Schema};

/// How an action is triggered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    /// Through a hook that runs an action task.
    #[default]
    Hook,
    /// Inline, in the caller's process.
    Callback,
}

/// One alternative of an action's context: attribute equality constraints.
pub type ContextAlternative = BTreeMap<String, String>;

type Availability = Arc<dyn Fn(&Parameters) -> bool + Send + Sync>;

/// Describes an action.
#[derive(Clone)]
pub struct ActionDescriptor {
    /// Action name shown to users; not unique.
    pub name: String,
    /// Callback name; unique together with `name`.
    pub cb_name: String,
    /// Human title.
    pub title: String,
    /// Treeherder symbol of the action task.
    pub symbol: String,
    /// Longer description.
    pub description: String,
    /// Trigger kind.
    pub kind: ActionKind,
    /// Applies to any kind of task.
    pub generic: bool,
    /// Tasks the action applies to; empty means any task or the task group.
    pub context: Vec<ContextAlternative>,
    /// Input schema, with defaults.
    pub schema: Option<Schema>,
    /// Ordering key; lower sorts first.
    pub order: u32,
    available: Availability,
}

impl ActionDescriptor {
    /// Creates a hook action with no context, no schema and order 10000.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        cb_name: impl Into<String>,
        title: impl Into<String>,
        symbol: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            cb_name: cb_name.into(),
            title: title.into(),
            symbol: symbol.into(),
            description: String::new(),
            kind: ActionKind::Hook,
            generic: false,
            context: Vec::new(),
            schema: None,
            order: 10_000,
            available: Arc::new(|_| true),
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the trigger kind.
    #[must_use]
    pub fn with_kind(mut self, kind: ActionKind) -> Self {
        self.kind = kind;
        self
    }

    /// Marks the action generic.
    #[must_use]
    pub fn generic(mut self) -> Self {
        self.generic = true;
        self
    }

    /// Adds a context alternative.
    #[must_use]
    pub fn with_context<I, K, V>(mut self, alternative: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.context
            .push(alternative.into_iter().map(|(k, v)| (k.into(), v.into())).collect());
        self
    }

    /// Sets the input schema.
    #[must_use]
    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Sets the order.
    #[must_use]
    pub fn with_order(mut self, order: u32) -> Self {
        self.order = order;
        self
    }

    /// Restricts the action to runs whose parameters satisfy `predicate`.
    #[must_use]
    pub fn with_availability<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Parameters) -> bool + Send + Sync + 'static,
    {
        self.available = Arc::new(predicate);
        self
    }

    /// Returns true if the action is offered for runs with `parameters`.
    #[must_use]
    pub fn is_available(&self, parameters: &Parameters) -> bool {
        (self.available)(parameters)
    }

    /// Returns true if the action applies to a task with `tags`, or to the
    /// task group when `tags` is `None`.
    #[must_use]
    pub fn matches_context(&self, tags: Option<&BTreeMap<String, String>>) -> bool {
        if self.context.is_empty() {
            return true;
        }
        tags.is_some_and(|tags| {
            self.context
                .iter()
                .any(|alternative| alternative.iter().all(|(k, v)| tags.get(k) == Some(v)))
        })
    }

    fn render(&self) -> Value {
        let mut action = json!({
            "name": self.name,
            "cb_name": self.cb_name,
            "title": self.title,
            "symbol": self.symbol,
            "description": self.description,
            "kind": self.kind,
            "generic": self.generic,
            "context": self.context,
            "order": self.order,
        });
        if let (Some(schema), Some(map)) = (&self.schema, action.as_object_mut()) {
            map.insert("schema".to_string(), schema.as_value().clone());
        }
        action
    }
}

impl fmt::Debug for ActionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionDescriptor")
            .field("name", &self.name)
            .field("cb_name", &self.cb_name)
            .field("kind", &self.kind)
            .field("context", &self.context)
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}

/// The code behind an action.
#[async_trait]
pub trait ActionCallback: Send + Sync {
    /// Runs the action with schema-validated `input`.
    async fn invoke(
        &self,
        services: &ActionServices,
        invocation: &ActionInvocation,
        input: Value,
    ) -> Result<ActionOutcome, TaskgraphError>;
}

struct RegisteredAction {
    descriptor: ActionDescriptor,
    callback: Arc<dyn ActionCallback>,
}

/// Collects actions before freezing them.
#[derive(Default)]
pub struct ActionRegistryBuilder {
    actions: Vec<RegisteredAction>,
}

impl ActionRegistryBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an action.
    #[must_use]
    pub fn register(mut self, descriptor: ActionDescriptor, callback: impl ActionCallback + 'static) -> Self {
        self.actions.push(RegisteredAction {
            descriptor,
            callback: Arc::new(callback),
        });
        self
    }

    /// Freezes the registry.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigurationError` if two actions share both name and
    /// callback name.
    pub fn build(self) -> Result<Arc<ActionRegistry>, ConfigurationError> {
        let mut seen = BTreeSet::new();
        for action in &self.actions {
            let key = (action.descriptor.name.as_str(), action.descriptor.cb_name.as_str());
            if !seen.insert(key) {
                return Err(ConfigurationError::new(format!(
                    "action '{}' with callback '{}' is registered twice",
                    key.0, key.1
                )));
            }
        }
        Ok(Arc::new(ActionRegistry { actions: self.actions }))
    }
}

impl fmt::Debug for ActionRegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRegistryBuilder")
            .field("actions", &self.actions.len())
            .finish()
    }
}

/// A frozen set of actions.
pub struct ActionRegistry {
    actions: Vec<RegisteredAction>,
}

impl ActionRegistry {
    /// Returns every descriptor, in registration order.
    pub fn descriptors(&self) -> impl Iterator<Item = &ActionDescriptor> {
        self.actions.iter().map(|a| &a.descriptor)
    }

    /// Returns the number of actions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Returns true if no action is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Looks up one action.
    #[must_use]
    pub fn find(&self, name: &str, cb_name: &str) -> Option<&ActionDescriptor> {
        self.entry(name, cb_name).map(|a| &a.descriptor)
    }

    fn entry(&self, name: &str, cb_name: &str) -> Option<&RegisteredAction> {
        self.actions
            .iter()
            .find(|a| a.descriptor.name == name && a.descriptor.cb_name == cb_name)
    }

    /// Returns the actions that apply to a task with `tags` (or to the task
    /// group when `None`) in a run with `parameters`, ordered by `order`,
    /// then name, then callback name.
    #[must_use]
    pub fn select(&self, tags: Option<&BTreeMap<String, String>>, parameters: &Parameters) -> Vec<&ActionDescriptor> {
        let mut selected: Vec<&ActionDescriptor> = self
            .descriptors()
            .filter(|d| d.is_available(parameters) && d.matches_context(tags))
            .collect();
        selected.sort_by(|a, b| (a.order, &a.name, &a.cb_name).cmp(&(b.order, &b.name, &b.cb_name)));
        selected
    }

    /// Validates `raw_input` and runs the action.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigurationError` for an unknown action or invalid
    /// input, and whatever the callback returns.
    #[tracing::instrument(skip(self, services, invocation, raw_input), fields(task_group_id = %invocation.task_group_id))]
    pub async fn invoke(
        &self,
        name: &str,
        cb_name: &str,
        services: &ActionServices,
        invocation: &ActionInvocation,
        raw_input: Value,
    ) -> Result<ActionOutcome, TaskgraphError> {
        let action = self
            .entry(name, cb_name)
            .ok_or_else(|| ConfigurationError::new(format!("no action '{name}' with callback '{cb_name}'")))?;

        let input = match &action.descriptor.schema {
            Some(schema) => schema.validate_with_defaults(raw_input).map_err(|violations| {
                let err = violations_error(&violations);
                ConfigurationError {
                    message: format!("invalid input for action '{name}': {}", err.message),
                    ..err
                }
            })?,
            None => raw_input,
        };

        info!(action = name, cb_name, task_id = ?invocation.task_id, "Invoking action");
        action.callback.invoke(services, invocation, input).await
    }

    /// Runs the first action named `name` that applies to the invocation's
    /// task.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigurationError` if no such action applies, otherwise
    /// as [`ActionRegistry::invoke`].
    pub async fn dispatch(
        &self,
        name: &str,
        services: &ActionServices,
        invocation: &ActionInvocation,
        raw_input: Value,
    ) -> Result<ActionOutcome, TaskgraphError> {
        let tags = invocation.task_tags();
        let cb_name = self
            .select(tags.as_ref(), &invocation.parameters)
            .into_iter()
            .find(|d| d.name == name)
            .map(|d| d.cb_name.clone())
            .ok_or_else(|| ConfigurationError::new(format!("no action '{name}' applies to this task")))?;
        self.invoke(name, &cb_name, services, invocation, raw_input).await
    }

    /// Renders the available actions for external callers.
    #[must_use]
    pub fn render_actions_json(&self, parameters: &Parameters) -> Value {
        let mut available: Vec<&ActionDescriptor> = self.descriptors().filter(|d| d.is_available(parameters)).collect();
        available.sort_by(|a, b| (a.order, &a.name, &a.cb_name).cmp(&(b.order, &b.name, &b.cb_name)));
        json!({
            "version": 1,
            "actions": available.into_iter().map(ActionDescriptor::render).collect::<Vec<_>>(),
        })
    }
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.descriptors().map(|d| (&d.name, &d.cb_name)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::util::{MockGraphLoader, MockTaskSubmitter};
    use crate::config::GraphConfig;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct Recording {
        inputs: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl ActionCallback for Arc<Recording> {
        async fn invoke(
            &self,
            _services: &ActionServices,
            _invocation: &ActionInvocation,
            input: Value,
        ) -> Result<ActionOutcome, TaskgraphError> {
            self.inputs.lock().push(input);
            Ok(ActionOutcome::Submitted { task_ids: vec![] })
        }
    }

    fn services() -> ActionServices {
        ActionServices::new(Arc::new(MockGraphLoader::new()), Arc::new(MockTaskSubmitter::new()))
    }

    fn tags(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect()
    }

    fn registry(recording: &Arc<Recording>) -> Arc<ActionRegistry> {
        ActionRegistryBuilder::new()
            .register(
                ActionDescriptor::new("retrigger", "generic", "Retrigger", "rt")
                    .with_context(Vec::<(String, String)>::new())
                    .with_order(19)
                    .with_schema(Schema::new(json!({
                        "type": "object",
                        "properties": {"times": {"type": "integer", "default": 1, "minimum": 1, "maximum": 6}},
                    }))),
                Arc::clone(recording),
            )
            .register(
                ActionDescriptor::new("retrigger", "mochitest", "Retrigger Mochitest", "rt")
                    .with_context([("test-type", "mochitest")])
                    .with_context([("test-type", "reftest")])
                    .with_order(10),
                Arc::clone(recording),
            )
            .register(
                ActionDescriptor::new("cancel-all", "cancel-all", "Cancel All", "cx").with_order(100),
                Arc::clone(recording),
            )
            .register(
                ActionDescriptor::new("release", "release", "Release", "rel")
                    .with_availability(|p| p.project == "mozilla-release"),
                Arc::clone(recording),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let recording = Arc::new(Recording::default());
        let err = ActionRegistryBuilder::new()
            .register(ActionDescriptor::new("a", "cb", "A", "a"), Arc::clone(&recording))
            .register(ActionDescriptor::new("a", "cb", "A", "a"), Arc::clone(&recording))
            .build()
            .unwrap_err();
        assert!(err.message.contains("registered twice"));
    }

    #[test]
    fn test_select_orders_and_filters() {
        let recording = Arc::new(Recording::default());
        let registry = registry(&recording);
        let params = Parameters::default();

        let mochitest = tags(&[("test-type", "mochitest")]);
        let names: Vec<&str> = registry
            .select(Some(&mochitest), &params)
            .iter()
            .map(|d| d.cb_name.as_str())
            .collect();
        assert_eq!(names, vec!["mochitest", "generic", "cancel-all"]);

        let build = tags(&[("kind", "build")]);
        let names: Vec<&str> = registry.select(Some(&build), &params).iter().map(|d| d.cb_name.as_str()).collect();
        assert_eq!(names, vec!["generic", "cancel-all"]);

        let names: Vec<&str> = registry.select(None, &params).iter().map(|d| d.cb_name.as_str()).collect();
        assert_eq!(names, vec!["cancel-all"]);

        let release = Parameters::new("mozilla-release");
        assert!(registry.select(None, &release).iter().any(|d| d.name == "release"));
    }

    #[tokio::test]
    async fn test_invoke_applies_defaults() {
        let recording = Arc::new(Recording::default());
        let registry = registry(&recording);
        let invocation = ActionInvocation::new(Parameters::default(), GraphConfig::default(), "GROUP");

        registry
            .invoke("retrigger", "generic", &services(), &invocation, Value::Null)
            .await
            .unwrap();
        assert_eq!(recording.inputs.lock()[0], json!({"times": 1}));
    }

    #[tokio::test]
    async fn test_invoke_rejects_bad_input() {
        let recording = Arc::new(Recording::default());
        let registry = registry(&recording);
        let invocation = ActionInvocation::new(Parameters::default(), GraphConfig::default(), "GROUP");

        let err = registry
            .invoke("retrigger", "generic", &services(), &invocation, json!({"times": 7}))
            .await
            .unwrap_err();
        match err {
            TaskgraphError::Configuration(e) => {
                assert_eq!(e.field.as_deref(), Some("times"));
                assert!(e.message.starts_with("invalid input for action 'retrigger'"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(recording.inputs.lock().is_empty());

        let unknown = registry
            .invoke("retrigger", "nope", &services(), &invocation, Value::Null)
            .await;
        assert!(matches!(unknown, Err(TaskgraphError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_dispatch_picks_first_applicable() {
        let recording = Arc::new(Recording::default());
        let registry = registry(&recording);
        let invocation = ActionInvocation::new(Parameters::default(), GraphConfig::default(), "GROUP")
            .with_task("T", json!({"tags": {"kind": "build"}, "metadata": {"name": "build-linux"}}));

        registry
            .dispatch("retrigger", &services(), &invocation, json!({}))
            .await
            .unwrap();
        assert_eq!(recording.inputs.lock()[0], json!({"times": 1}));

        let missing = registry.dispatch("release", &services(), &invocation, json!({})).await;
        assert!(missing.is_err());
    }

    #[test]
    fn test_render_actions_json() {
        let recording = Arc::new(Recording::default());
        let registry = registry(&recording);
        let rendered = registry.render_actions_json(&Parameters::default());

        assert_eq!(rendered["version"], 1);
        let actions = rendered["actions"].as_array().unwrap();
        assert_eq!(actions.len(), 3);
        assert_eq!(actions[0]["cb_name"], "mochitest");
        assert_eq!(
            actions[0]["context"],
            json!([{"test-type": "mochitest"}, {"test-type": "reftest"}])
        );
        assert_eq!(actions[1]["schema"]["properties"]["times"]["default"], 1);
        assert!(actions[2].get("schema").is_none());
        assert_eq!(actions[2]["kind"], "hook");
    }
}
