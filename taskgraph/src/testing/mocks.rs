//! In-memory collaborators for action tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::actions::util::{GraphLoader, LoadedGraph, TaskSubmitter};
use crate::config::{GraphConfig, Parameters};
use crate::errors::{SubmissionError, TaskgraphError};

/// A graph loader that always returns the same executed graph.
#[derive(Debug)]
pub struct InMemoryGraphLoader {
    graph: LoadedGraph,
    calls: Mutex<usize>,
}

impl InMemoryGraphLoader {
    /// Creates a loader serving `graph`.
    #[must_use]
    pub fn new(graph: LoadedGraph) -> Self {
        Self {
            graph,
            calls: Mutex::new(0),
        }
    }

    /// Returns the number of fetches.
    #[must_use]
    pub fn call_count(&self) -> usize {
        *self.calls.lock()
    }
}

#[async_trait]
impl GraphLoader for InMemoryGraphLoader {
    async fn fetch_graph_and_labels(
        &self,
        _parameters: &Parameters,
        _graph_config: &GraphConfig,
    ) -> Result<LoadedGraph, TaskgraphError> {
        *self.calls.lock() += 1;
        Ok(self.graph.clone())
    }
}

/// One accepted submission.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    /// The identifier the task was created under.
    pub task_id: String,
    /// The definition as submitted.
    pub definition: Value,
    /// The SCM level.
    pub level: String,
}

impl Submission {
    /// The submitted task's `metadata.name`.
    #[must_use]
    pub fn label(&self) -> Option<&str> {
        self.definition.pointer("/metadata/name").and_then(Value::as_str)
    }
}

/// A submitter that accepts everything and remembers it. Resubmitting an
/// identifier is a no-op.
#[derive(Debug, Default)]
pub struct RecordingSubmitter {
    submissions: Mutex<Vec<Submission>>,
}

impl RecordingSubmitter {
    /// Creates an empty submitter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every accepted submission, in order.
    #[must_use]
    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().clone()
    }

    /// Returns the accepted identifiers, in order.
    #[must_use]
    pub fn task_ids(&self) -> Vec<String> {
        self.submissions.lock().iter().map(|s| s.task_id.clone()).collect()
    }

    /// Returns the submissions of tasks named `label`.
    #[must_use]
    pub fn find_by_label(&self, label: &str) -> Vec<Submission> {
        self.submissions
            .lock()
            .iter()
            .filter(|s| s.label() == Some(label))
            .cloned()
            .collect()
    }

    /// Returns the number of accepted submissions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.submissions.lock().len()
    }

    /// Returns true if nothing was submitted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.submissions.lock().is_empty()
    }
}

#[async_trait]
impl TaskSubmitter for RecordingSubmitter {
    async fn submit(&self, task_id: &str, definition: &Value, level: &str) -> Result<(), SubmissionError> {
        let mut submissions = self.submissions.lock();
        if !submissions.iter().any(|s| s.task_id == task_id) {
            submissions.push(Submission {
                task_id: task_id.to_string(),
                definition: definition.clone(),
                level: level.to_string(),
            });
        }
        Ok(())
    }
}

/// A submitter that refuses every task.
#[derive(Debug, Clone)]
pub struct RejectingSubmitter {
    reason: String,
}

impl RejectingSubmitter {
    /// Creates a submitter rejecting with `reason`.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

#[async_trait]
impl TaskSubmitter for RejectingSubmitter {
    async fn submit(&self, task_id: &str, _definition: &Value, _level: &str) -> Result<(), SubmissionError> {
        Err(SubmissionError::rejected(task_id, self.reason.clone()))
    }
}

/// A submitter whose first `failures` calls fail transiently.
#[derive(Debug, Default)]
pub struct FlakySubmitter {
    failures_left: Mutex<usize>,
    attempts: Mutex<usize>,
    inner: RecordingSubmitter,
}

impl FlakySubmitter {
    /// Creates a submitter failing `failures` times before accepting.
    #[must_use]
    pub fn new(failures: usize) -> Self {
        Self {
            failures_left: Mutex::new(failures),
            ..Self::default()
        }
    }

    /// Returns the number of calls so far.
    #[must_use]
    pub fn attempts(&self) -> usize {
        *self.attempts.lock()
    }

    /// Returns the accepted submissions.
    #[must_use]
    pub fn accepted(&self) -> &RecordingSubmitter {
        &self.inner
    }
}

#[async_trait]
impl TaskSubmitter for FlakySubmitter {
    async fn submit(&self, task_id: &str, definition: &Value, level: &str) -> Result<(), SubmissionError> {
        *self.attempts.lock() += 1;
        {
            let mut left = self.failures_left.lock();
            if *left > 0 {
                *left -= 1;
                return Err(SubmissionError::transient(task_id, "service unavailable"));
            }
        }
        self.inner.submit(task_id, definition, level).await
    }
}
