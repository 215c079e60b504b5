//! Task graphs and the structural queries over them.

#[allow(clippy::module_inception)]
mod graph;
mod taskgraph;
pub mod validation;

pub use graph::{Edge, Graph};
pub use taskgraph::TaskGraph;
