//! Persistent local store: the sole owner of durable state.
//!
//! Records are opaque JSON documents grouped into named collections. Each
//! collection declares a key path and any number of secondary indexes.
//! Multi-record writes always happen inside one SQLite transaction.

mod error;
mod schema;
mod sqlite;

pub use error::{StoreError, StoreResult};
pub use schema::{CollectionDef, IndexDef, StoreSchema, CACHE_METADATA, SYNC_QUEUE};
pub use sqlite::{LocalStore, StoreLocation, StoreTx};
