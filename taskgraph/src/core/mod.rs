//! Core domain model types.
//!
//! - [`JobRecord`]: a job description as it flows through transforms
//! - [`Task`]: the canonical task definition stored in a graph

mod record;
mod task;

pub use record::{escape_pointer_token, merge_into, JobRecord, NO_LABEL};
pub(crate) use record::type_name;
pub use task::{string_map, Task};
