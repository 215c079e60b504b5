//! Stage trait and implementations.
//!
//! Stages are the units a transform sequence is built from. Each one maps a
//! lazy stream of job records to another lazy stream; it may yield zero, one
//! or many records per input.

use crate::core::JobRecord;
use crate::errors::TaskgraphError;
use crate::transforms::TransformConfig;
use std::fmt::Debug;

/// A lazy stream of job records. An `Err` item aborts the run.
pub type JobStream<'a> = Box<dyn Iterator<Item = Result<JobRecord, TaskgraphError>> + 'a>;

/// Trait for transform stages.
///
/// Stages are stateless across invocations; per-run state lives in the
/// [`TransformConfig`].
pub trait Stage: Send + Sync + Debug {
    /// Returns the name of the stage.
    fn name(&self) -> &str;

    /// Applies the stage to a stream of records.
    fn apply<'a>(&'a self, config: &'a TransformConfig, jobs: JobStream<'a>) -> JobStream<'a>;
}

/// A stage built from a per-record function returning any number of
/// records.
pub struct FnStage<F>
where
    F: Fn(&TransformConfig, JobRecord) -> Result<Vec<JobRecord>, TaskgraphError> + Send + Sync,
{
    name: String,
    func: F,
}

impl<F> FnStage<F>
where
    F: Fn(&TransformConfig, JobRecord) -> Result<Vec<JobRecord>, TaskgraphError> + Send + Sync,
{
    /// Creates a new function-based stage.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Debug for FnStage<F>
where
    F: Fn(&TransformConfig, JobRecord) -> Result<Vec<JobRecord>, TaskgraphError> + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStage").field("name", &self.name).finish()
    }
}

impl<F> Stage for FnStage<F>
where
    F: Fn(&TransformConfig, JobRecord) -> Result<Vec<JobRecord>, TaskgraphError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn apply<'a>(&'a self, config: &'a TransformConfig, jobs: JobStream<'a>) -> JobStream<'a> {
        Box::new(jobs.flat_map(move |job| {
            let produced: Vec<Result<JobRecord, TaskgraphError>> = match job {
                Ok(job) => match (self.func)(config, job) {
                    Ok(records) => records.into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(e)],
                },
                Err(e) => vec![Err(e)],
            };
            produced
        }))
    }
}

/// Wraps a one-to-one function as a stage.
pub fn map_stage<F>(
    name: impl Into<String>,
    func: F,
) -> FnStage<impl Fn(&TransformConfig, JobRecord) -> Result<Vec<JobRecord>, TaskgraphError> + Send + Sync>
where
    F: Fn(&TransformConfig, JobRecord) -> Result<JobRecord, TaskgraphError> + Send + Sync,
{
    FnStage::new(name, move |config: &TransformConfig, job| func(config, job).map(|job| vec![job]))
}

/// Wraps a predicate as a stage that drops records it rejects.
pub fn filter_stage<F>(
    name: impl Into<String>,
    predicate: F,
) -> FnStage<impl Fn(&TransformConfig, JobRecord) -> Result<Vec<JobRecord>, TaskgraphError> + Send + Sync>
where
    F: Fn(&TransformConfig, &JobRecord) -> bool + Send + Sync,
{
    FnStage::new(name, move |config: &TransformConfig, job| {
        Ok(if predicate(config, &job) { vec![job] } else { Vec::new() })
    })
}

/// A stage that passes records through unchanged.
#[derive(Debug, Clone)]
pub struct NoOpStage {
    name: String,
}

impl NoOpStage {
    /// Creates a new no-op stage.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Stage for NoOpStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply<'a>(&'a self, _config: &'a TransformConfig, jobs: JobStream<'a>) -> JobStream<'a> {
        jobs
    }
}
