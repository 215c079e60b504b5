//! Transform sequences and the stages most kinds share.

pub mod common;
mod config;
mod sequence;

pub use common::{CopyDependentAttributes, MakeLabel, ResolveKeyedByStage, ValidateStage};
pub use config::TransformConfig;
pub use sequence::TransformSequence;
