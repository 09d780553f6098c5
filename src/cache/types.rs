//! Core types for the read cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Freshness record kept per cached collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetadata {
  pub collection: String,
  /// Completion time of the response the collection was last refreshed from
  /// (epoch ms)
  pub last_updated: i64,
  pub schema_version: u32,
}

impl CacheMetadata {
  pub fn last_updated_at(&self) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(self.last_updated)
  }
}

/// A collection served from the local store instead of the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedCollection {
  pub collection: String,
  /// JSON array of the stored records, each exactly as it was fetched
  pub body: String,
  pub records: usize,
  pub last_updated: i64,
}

/// What happened to a response offered to the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheWrite {
  Stored { collection: String, records: usize },
  /// A response that completed later has already been stored
  Superseded { collection: String },
  /// Not a complete, successful collection read
  NotCacheable,
}
