//! Read-cache integration.
//!
//! This module mirrors collection reads into the local store:
//! - Successful, complete list reads replace the mirrored collection
//! - Each collection carries freshness metadata (`cache_metadata`)
//! - Out-of-order responses are resolved by completion time
//! - Offline reads are answered from the last stored snapshot

mod layer;
mod routes;
mod types;

pub use layer::ReadCache;
pub use routes::{CacheRoute, RouteMatch, RouteTable};
pub use types::{CacheMetadata, CacheWrite, CachedCollection};
