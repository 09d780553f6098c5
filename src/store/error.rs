//! Typed failures of the local store.

use thiserror::Error;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors raised by [`LocalStore`](super::LocalStore) operations.
///
/// Callers decide whether to degrade; the store never swallows a failure.
#[derive(Debug, Error)]
pub enum StoreError {
  #[error("failed to open local store at {path}: {reason}")]
  Open { path: String, reason: String },

  #[error("failed to migrate local store to version {version}: {reason}")]
  Migration { version: u32, reason: String },

  #[error("unknown collection '{0}'")]
  UnknownCollection(String),

  #[error("collection '{collection}' has no index named '{index}'")]
  UnknownIndex { collection: String, index: String },

  #[error("record in '{collection}' has no usable key at '{key_path}'")]
  MissingKey {
    collection: String,
    key_path: String,
  },

  #[error("failed to serialize record: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("local store lock poisoned")]
  Poisoned,

  #[error("local store work interrupted: {0}")]
  Interrupted(String),
}
