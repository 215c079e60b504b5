//! Ordered transform sequences.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use super::TransformConfig;
use crate::core::{JobRecord, Task};
use crate::errors::{StructuralError, TaskgraphError};
use crate::stages::{JobStream, Stage};

/// An ordered list of stages applied by iterator chaining.
///
/// Stage order is significant. Records flow lazily: nothing runs until the
/// output stream is consumed.
#[derive(Clone, Default)]
pub struct TransformSequence {
    stages: Vec<Arc<dyn Stage>>,
}

impl fmt::Debug for TransformSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformSequence")
            .field("stages", &self.stage_names())
            .finish()
    }
}

impl TransformSequence {
    /// Creates an empty sequence.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a stage.
    #[must_use]
    pub fn with_stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    /// Appends a shared stage.
    pub fn add(&mut self, stage: Arc<dyn Stage>) {
        self.stages.push(stage);
    }

    /// Appends every stage of another sequence.
    #[must_use]
    pub fn extend(mut self, other: &Self) -> Self {
        self.stages.extend(other.stages.iter().cloned());
        self
    }

    /// Returns the stage names in order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if the sequence has no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Chains every stage over `jobs` and returns the lazy result.
    pub fn stream<'a, I>(&'a self, config: &'a TransformConfig, jobs: I) -> JobStream<'a>
    where
        I: IntoIterator<Item = JobRecord>,
        I::IntoIter: 'a,
    {
        let initial: JobStream<'a> = Box::new(jobs.into_iter().map(Ok));
        self.stages
            .iter()
            .fold(initial, |stream, stage| stage.apply(config, stream))
    }

    /// Runs the sequence and builds one [`Task`] per surviving record.
    ///
    /// # Errors
    ///
    /// The first failing record aborts the run. Records that do not describe
    /// a task are `ConfigurationError`s; duplicate labels within the run are
    /// `StructuralError`s.
    pub fn run<I>(&self, config: &TransformConfig, jobs: I) -> Result<Vec<Task>, TaskgraphError>
    where
        I: IntoIterator<Item = JobRecord>,
        I::IntoIter: 'static,
    {
        tracing::debug!(kind = %config.kind, stages = ?self.stage_names(), "Running transforms");

        let mut seen = HashSet::new();
        let mut tasks = Vec::new();
        for job in self.stream(config, jobs) {
            let task = Task::from_description(&config.kind, job?)?;
            if !seen.insert(task.label.clone()) {
                return Err(StructuralError::DuplicateLabel { label: task.label }.into());
            }
            tasks.push(task);
        }

        tracing::debug!(kind = %config.kind, count = tasks.len(), "Transforms produced tasks");
        Ok(tasks)
    }
}
