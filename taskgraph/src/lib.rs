//! # Taskgraph
//!
//! Declarative task graph generation and retrigger actions for a CI system.
//!
//! Taskgraph provides:
//!
//! - **Keyed-by resolution**: configuration values that vary by platform,
//!   project or level, resolved against a job and the run parameters
//! - **Transform pipelines**: ordered stages turning job descriptions into
//!   task definitions, with schema validation between them
//! - **Task graphs**: labelled tasks, dependency edges, transitive closure
//!   and submission waves
//! - **Parameterization**: `task-reference`, `artifact-reference` and
//!   `relative-datestamp` placeholders
//! - **Actions**: a registry of user-triggered operations, including the
//!   `retrigger` family
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use taskgraph::prelude::*;
//!
//! let registry = register_retrigger_actions(ActionRegistryBuilder::new()).build()?;
//! let services = ActionServices::new(loader, submitter);
//! let invocation = ActionInvocation::new(parameters, graph_config, task_group_id)
//!     .with_task(task_id, task_definition);
//!
//! let outcome = registry
//!     .dispatch("retrigger", &services, &invocation, serde_json::json!({"times": 2}))
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod actions;
pub mod config;
pub mod core;
pub mod errors;
pub mod generator;
pub mod graph;
pub mod observability;
pub mod parameterization;
pub mod schema;
pub mod stages;
pub mod testing;
pub mod transforms;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::actions::{
        register_retrigger_actions, ActionCallback, ActionDescriptor, ActionInvocation, ActionOutcome,
        ActionRegistry, ActionRegistryBuilder, ActionServices, GraphLoader, LoadedGraph, TaskSubmitter,
    };
    pub use crate::config::{GraphConfig, Parameters};
    pub use crate::core::{JobRecord, Task};
    pub use crate::errors::{
        ConfigurationError, ReferenceError, StructuralError, SubmissionError, TaskgraphError,
    };
    pub use crate::generator::{KindDefinition, TaskGraphGenerator};
    pub use crate::graph::{Graph, TaskGraph};
    pub use crate::observability::{init_logging, LogFormat};
    pub use crate::schema::{resolve_keyed_by, Schema};
    pub use crate::stages::Stage;
    pub use crate::transforms::{TransformConfig, TransformSequence};
    pub use crate::utils::{IdGenerator, Timestamp};
}
