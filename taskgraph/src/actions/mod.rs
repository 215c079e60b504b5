//! Actions: user-triggered operations on an already executed graph.
//!
//! An [`ActionRegistry`] holds descriptors and callbacks. Callers select
//! the actions applicable to a task by its tags, then invoke one with
//! schema-validated input. Callbacks reach the outside world only through
//! [`ActionServices`].

mod context;
pub mod registry;
pub mod retrigger;
pub mod util;

pub use context::{ActionInvocation, ActionOutcome, ActionServices};
pub use registry::{
    ActionCallback, ActionDescriptor, ActionKind, ActionRegistry, ActionRegistryBuilder, ContextAlternative,
};
pub use retrigger::register_retrigger_actions;
pub use util::{ArtifactStore, GraphLoader, LoadedGraph, TaskSubmitter};
