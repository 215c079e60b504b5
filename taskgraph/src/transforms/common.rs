//! Reusable stages shared by many kinds.

use serde_json::{Map, Value};

use super::TransformConfig;
use crate::core::JobRecord;
use crate::errors::{ConfigurationError, TaskgraphError};
use crate::schema::keyed_by::resolve_keyed_by_or;
use crate::schema::{violations_error, Schema};
use crate::stages::{JobStream, Stage};

/// Attributes copied from the upstream task by [`CopyDependentAttributes`].
pub const DEPENDENT_ATTRIBUTES: &[&str] = &[
    "build_platform",
    "build_type",
    "l10n_chunk",
    "locale",
    "nightly",
    "shipping_phase",
    "shipping_product",
    "signed",
    "stub-installer",
];

fn dependent_attribute<'a>(job: &'a JobRecord, key: &str) -> Option<&'a Value> {
    job.get("dependent-task.attributes")
        .and_then(|attributes| attributes.get(key))
        .filter(|v| !v.is_null())
}

/// Validates every record against a schema.
///
/// Failures name the kind and the record's best-known label.
#[derive(Debug, Clone)]
pub struct ValidateStage {
    name: String,
    schema: Schema,
}

impl ValidateStage {
    /// Creates a validation checkpoint.
    #[must_use]
    pub fn new(schema: Schema) -> Self {
        Self {
            name: "validate".to_string(),
            schema,
        }
    }

    /// Renames the stage, for sequences with several checkpoints.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn check(&self, config: &TransformConfig, job: JobRecord) -> Result<JobRecord, TaskgraphError> {
        let value = job.into_value();
        match self.schema.validate(&value) {
            Ok(()) => Ok(JobRecord::from_value(value)?),
            Err(violations) => {
                let label = JobRecord::from_value(value)
                    .map(|job| job.best_label())
                    .unwrap_or_default();
                Err(violations_error(&violations)
                    .with_kind(config.kind.clone())
                    .with_label(label)
                    .into())
            }
        }
    }
}

impl Stage for ValidateStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply<'a>(&'a self, config: &'a TransformConfig, jobs: JobStream<'a>) -> JobStream<'a> {
        Box::new(jobs.map(move |job| self.check(config, job?)))
    }
}

/// Resolves keyed-by values for a list of fields.
///
/// Named run parameters (by default `project`) take precedence over record
/// fields as driving values.
#[derive(Debug, Clone)]
pub struct ResolveKeyedByStage {
    fields: Vec<(String, Option<Value>)>,
    parameters: Vec<String>,
}

impl ResolveKeyedByStage {
    /// Creates a stage resolving `fields` in order.
    #[must_use]
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(|f| (f.into(), None)).collect(),
            parameters: vec!["project".to_string()],
        }
    }

    /// Adds a field with a fallback used when no alternative matches.
    #[must_use]
    pub fn with_defaulted_field(mut self, field: impl Into<String>, default: Value) -> Self {
        self.fields.push((field.into(), Some(default)));
        self
    }

    /// Exposes another run parameter as a driving value.
    #[must_use]
    pub fn with_parameter(mut self, name: impl Into<String>) -> Self {
        self.parameters.push(name.into());
        self
    }

    fn resolve(&self, config: &TransformConfig, mut job: JobRecord) -> Result<JobRecord, TaskgraphError> {
        let extra: Map<String, Value> = self
            .parameters
            .iter()
            .filter_map(|name| config.parameters.get(name).map(|v| (name.clone(), v)))
            .collect();
        let item_name = job.best_label();

        for (field, default) in &self.fields {
            resolve_keyed_by_or(&mut job, field, &item_name, &extra, default.as_ref())
                .map_err(|e| e.with_kind(config.kind.clone()))?;
        }
        Ok(job)
    }
}

impl Stage for ResolveKeyedByStage {
    fn name(&self) -> &str {
        "resolve-keyed-by"
    }

    fn apply<'a>(&'a self, config: &'a TransformConfig, jobs: JobStream<'a>) -> JobStream<'a> {
        Box::new(jobs.map(move |job| self.resolve(config, job?)))
    }
}

/// Copies classification attributes from the upstream `dependent-task`.
///
/// The record's own attributes win over copied ones.
#[derive(Debug, Clone, Default)]
pub struct CopyDependentAttributes {
    extra_keys: Vec<String>,
}

impl CopyDependentAttributes {
    /// Creates the stage with the standard attribute list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies one more attribute.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.extra_keys.push(key.into());
        self
    }

    fn copy(&self, mut job: JobRecord) -> Result<JobRecord, TaskgraphError> {
        let keys = DEPENDENT_ATTRIBUTES
            .iter()
            .copied()
            .chain(self.extra_keys.iter().map(String::as_str));

        let copied: Vec<(String, Value)> = keys
            .filter_map(|key| dependent_attribute(&job, key).map(|v| (key.to_string(), v.clone())))
            .collect();

        for (key, value) in copied {
            let path = format!("attributes.{key}");
            if !job.contains(&path) {
                job.set(&path, value)?;
            }
        }
        Ok(job)
    }
}

impl Stage for CopyDependentAttributes {
    fn name(&self) -> &str {
        "copy-dependent-attributes"
    }

    fn apply<'a>(&'a self, _config: &'a TransformConfig, jobs: JobStream<'a>) -> JobStream<'a> {
        Box::new(jobs.map(move |job| self.copy(job?)))
    }
}

/// Generates labels for tasks built from an upstream task.
///
/// Templates, by precedence:
/// - `{kind}-{locale}-{build_platform}/{build_type}` for locale repacks
/// - `{kind}-{build_platform}-{l10n_chunk}/{build_type}` for chunked l10n
/// - `{kind}-{build_platform}[-{repack_id}]` for partner and eme-free repacks
/// - `{kind}-{build_platform}/{build_type}` otherwise
#[derive(Debug, Clone, Copy, Default)]
pub struct MakeLabel;

const REPACK_KIND_PREFIXES: &[&str] = &["release-eme-free", "release-partner-repack"];

impl MakeLabel {
    fn label(config: &TransformConfig, job: &JobRecord) -> Result<String, ConfigurationError> {
        let attr = |key: &str| dependent_attribute(job, key).and_then(Value::as_str);
        let kind = config.kind.as_str();
        let fail = |message: &str| {
            ConfigurationError::new(message)
                .with_kind(kind)
                .with_label(job.best_label())
                .with_field("dependent-task")
        };

        let build_platform = attr("build_platform")
            .ok_or_else(|| fail("dependent task has no build_platform attribute"))?;
        let build_type = || attr("build_type").ok_or_else(|| fail("dependent task has no build_type attribute"));

        if let Some(locale) = attr("locale").or_else(|| job.get_str("locale")) {
            return Ok(format!("{kind}-{locale}-{build_platform}/{}", build_type()?));
        }
        if let Some(chunk) = dependent_attribute(job, "l10n_chunk").filter(|c| !c.as_str().is_some_and(str::is_empty)) {
            let chunk = chunk.as_str().map_or_else(|| chunk.to_string(), ToString::to_string);
            return Ok(format!("{kind}-{build_platform}-{chunk}/{}", build_type()?));
        }
        if REPACK_KIND_PREFIXES.iter().any(|prefix| kind.starts_with(prefix)) {
            return Ok(match job.get_str("extra.repack_id") {
                Some(repack_id) => format!("{kind}-{build_platform}-{}", repack_id.replace('/', "-")),
                None => format!("{kind}-{build_platform}"),
            });
        }
        Ok(format!("{kind}-{build_platform}/{}", build_type()?))
    }
}

impl Stage for MakeLabel {
    fn name(&self) -> &str {
        "make-label"
    }

    fn apply<'a>(&'a self, config: &'a TransformConfig, jobs: JobStream<'a>) -> JobStream<'a> {
        Box::new(jobs.map(move |job| {
            let mut job = job?;
            let label = Self::label(config, &job)?;
            job.set("label", Value::String(label))?;
            Ok(job)
        }))
    }
}
