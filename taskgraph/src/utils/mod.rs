//! Utilities for identifiers, timestamps and retries.

pub mod retry;
pub mod slugid;
pub mod timestamps;

pub use retry::{with_retry, BackoffStrategy, JitterStrategy, RetryConfig};
pub use slugid::{IdGenerator, SequentialIdGenerator, SlugIdGenerator};
pub use timestamps::{format_timestamp, parse_timestamp, Timestamp, TimestampError};
