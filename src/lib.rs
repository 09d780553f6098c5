//! Offline-first sync engine for field sales clients.
//!
//! Requests go through an interception layer. Reads are mirrored into a local
//! SQLite store and served from it when the server cannot be reached; writes
//! made offline are queued durably and replayed in capture order once
//! connectivity returns.

pub mod cache;
pub mod config;
pub mod connectivity;
pub mod engine;
pub mod interceptor;
pub mod logging;
pub mod scheduler;
pub mod status;
pub mod store;
pub mod sync;
pub mod transport;

pub use config::Config;
pub use engine::SyncEngine;
pub use status::StatusSnapshot;

/// Current time as epoch milliseconds.
pub(crate) fn now_ms() -> i64 {
  chrono::Utc::now().timestamp_millis()
}
