//! Mutation queue and the processor that drains it.

mod processor;
mod queue;
mod types;

pub use processor::{RetryPolicy, SyncProcessor};
pub use queue::MutationQueue;
pub use types::{CapturedRequest, DrainReport, MutationStatus, QueuedMutation, SyncEvent};
