//! Testing utilities for graphs and actions.
//!
//! This module provides:
//! - In-memory graph loaders and submitters
//! - Fixture builders for executed graphs
//! - Assertions over graphs and definitions

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{assert_graph_consistent, assert_no_placeholders, assert_submitted_labels};
pub use fixtures::{mochitest_task, task_fixture, GraphFixture, TestHarness, DECISION_TASK_ID};
pub use mocks::{FlakySubmitter, InMemoryGraphLoader, RecordingSubmitter, RejectingSubmitter, Submission};
