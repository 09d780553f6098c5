//! Read cache that mirrors successful collection reads into the local store.

use chrono::{Duration, Utc};
use serde_json::value::RawValue;
use std::sync::Arc;
use tracing::debug;

use crate::store::{LocalStore, StoreResult, CACHE_METADATA};
use crate::transport::{HttpRequest, HttpResponse};

use super::routes::{CacheRoute, RouteTable};
use super::types::{CacheMetadata, CacheWrite, CachedCollection};

/// Read cache over the local store.
///
/// Successful list reads for a routed collection replace that collection's
/// records. When the network is gone the same records are served back,
/// unchanged, as the response body.
#[derive(Clone)]
pub struct ReadCache {
  store: Arc<LocalStore>,
  routes: Arc<RouteTable>,
  schema_version: u32,
}

impl ReadCache {
  pub fn new(store: Arc<LocalStore>, routes: Vec<CacheRoute>, schema_version: u32) -> Self {
    Self {
      store,
      routes: Arc::new(RouteTable::new(routes)),
      schema_version,
    }
  }

  /// Collection mirrored by `url`, if any.
  pub fn collection_for(&self, url: &str) -> Option<&str> {
    self.routes.resolve(url).map(|m| m.collection)
  }

  /// Offer a completed response to the cache.
  ///
  /// Only complete (unfiltered) successful GETs of a routed collection whose
  /// body is a JSON array are stored.
  pub async fn record_response(
    &self,
    request: &HttpRequest,
    response: &HttpResponse,
  ) -> StoreResult<CacheWrite> {
    if request.method != "GET" || !response.is_success() {
      return Ok(CacheWrite::NotCacheable);
    }
    let Some(route) = self.routes.resolve(&request.url) else {
      return Ok(CacheWrite::NotCacheable);
    };
    if route.filtered {
      debug!(url = %request.url, "filtered read not cached");
      return Ok(CacheWrite::NotCacheable);
    }

    let records: Vec<Box<RawValue>> = match serde_json::from_str(&response.body) {
      Ok(records) => records,
      Err(e) => {
        debug!(url = %request.url, error = %e, "response is not a record array, not cached");
        return Ok(CacheWrite::NotCacheable);
      }
    };

    self
      .refresh(route.collection, &records, response.completed_at)
      .await
  }

  /// Replace `collection` with `records` fetched at `completed_at`.
  ///
  /// Responses are ordered by completion time: one that finished before the
  /// stored snapshot is dropped.
  pub async fn refresh(
    &self,
    collection: &str,
    records: &[Box<RawValue>],
    completed_at: i64,
  ) -> StoreResult<CacheWrite> {
    let schema_version = self.schema_version;
    let write = self
      .store
      .transaction(|tx| {
        let current: Option<CacheMetadata> = tx.get(CACHE_METADATA, collection)?;
        if current.is_some_and(|meta| meta.last_updated > completed_at) {
          return Ok(CacheWrite::Superseded {
            collection: collection.to_string(),
          });
        }

        tx.clear(collection)?;
        tx.put(collection, records)?;
        tx.put_one(
          CACHE_METADATA,
          &CacheMetadata {
            collection: collection.to_string(),
            last_updated: completed_at,
            schema_version,
          },
        )?;
        Ok(CacheWrite::Stored {
          collection: collection.to_string(),
          records: records.len(),
        })
      })
      .await?;

    match &write {
      CacheWrite::Stored { collection, records } => {
        debug!(%collection, records, "collection cached")
      }
      CacheWrite::Superseded { collection } => {
        debug!(%collection, "out-of-order response dropped")
      }
      CacheWrite::NotCacheable => {}
    }
    Ok(write)
  }

  /// Last stored snapshot of the collection mirrored by `url`.
  ///
  /// `None` when the URL is not routed or the collection was never fetched.
  pub async fn fallback(&self, url: &str) -> StoreResult<Option<CachedCollection>> {
    let Some(route) = self.routes.resolve(url) else {
      return Ok(None);
    };
    let collection = route.collection;

    let snapshot = self
      .store
      .transaction(|tx| {
        let Some(meta) = tx.get::<CacheMetadata>(CACHE_METADATA, collection)? else {
          return Ok(None);
        };
        let records: Vec<Box<RawValue>> = tx.get_all(collection)?;
        Ok(Some((meta, records)))
      })
      .await?;

    Ok(snapshot.map(|(meta, records)| {
      let body = format!(
        "[{}]",
        records
          .iter()
          .map(|r| r.get())
          .collect::<Vec<_>>()
          .join(",")
      );
      CachedCollection {
        collection: collection.to_string(),
        body,
        records: records.len(),
        last_updated: meta.last_updated,
      }
    }))
  }

  pub async fn metadata(&self, collection: &str) -> StoreResult<Option<CacheMetadata>> {
    self.store.get(CACHE_METADATA, collection).await
  }

  /// Whether `collection` was never cached or was refreshed more than
  /// `max_age` ago.
  pub async fn is_stale(&self, collection: &str, max_age: Duration) -> StoreResult<bool> {
    Ok(match self.metadata(collection).await? {
      Some(meta) => meta
        .last_updated_at()
        .map_or(true, |at| Utc::now() - at > max_age),
      None => true,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::{CollectionDef, StoreSchema};
  use serde_json::Value;

  fn cache() -> ReadCache {
    let schema = StoreSchema::new(1)
      .with_collection(CollectionDef::new("clients", "id"))
      .with_collection(CollectionDef::new("calls", "id"));
    let store = Arc::new(LocalStore::in_memory(schema));
    ReadCache::new(
      store,
      vec![
        CacheRoute {
          path: "/api/clients".into(),
          collection: "clients".into(),
        },
        CacheRoute {
          path: "/api/calls".into(),
          collection: "calls".into(),
        },
      ],
      1,
    )
  }

  fn response_at(status: u16, body: &str, completed_at: i64) -> HttpResponse {
    HttpResponse {
      completed_at,
      ..HttpResponse::new(status, body)
    }
  }

  #[tokio::test]
  async fn test_offline_read_returns_fetched_records_verbatim() {
    let cache = cache();
    let body = r#"[{"id":1,"name":"Ana","score":1.50},  {"name":"Luis","id":"x-2"}]"#;
    let write = cache
      .record_response(&HttpRequest::get("/api/clients"), &response_at(200, body, 10))
      .await
      .unwrap();
    assert_eq!(
      write,
      CacheWrite::Stored {
        collection: "clients".into(),
        records: 2
      }
    );

    let cached = cache.fallback("/api/clients").await.unwrap().unwrap();
    assert_eq!(
      cached.body,
      r#"[{"id":1,"name":"Ana","score":1.50},{"name":"Luis","id":"x-2"}]"#
    );
    assert_eq!(cached.records, 2);
    assert_eq!(cached.last_updated, 10);
  }

  #[tokio::test]
  async fn test_errors_and_partial_reads_are_not_cached() {
    let cache = cache();
    let get = HttpRequest::get("/api/clients");

    for (request, response) in [
      (get.clone(), response_at(500, r#"[{"id":1}]"#, 1)),
      (get.clone(), response_at(200, r#"{"error":"oops"}"#, 1)),
      (get.clone(), response_at(200, r#"[{"id":1}"#, 1)),
      (HttpRequest::get("/api/clients?owner=me"), response_at(200, r#"[{"id":1}]"#, 1)),
      (HttpRequest::get("/api/clients/1"), response_at(200, r#"[{"id":1}]"#, 1)),
      (HttpRequest::new("HEAD", "/api/clients"), response_at(200, r#"[{"id":1}]"#, 1)),
    ] {
      let write = cache.record_response(&request, &response).await.unwrap();
      assert_eq!(write, CacheWrite::NotCacheable, "{:?}", request);
    }
    assert!(cache.fallback("/api/clients").await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_older_completion_never_overwrites_newer() {
    let cache = cache();
    let get = HttpRequest::get("/api/calls");

    cache
      .record_response(&get, &response_at(200, r#"[{"id":1,"v":"new"}]"#, 200))
      .await
      .unwrap();
    let write = cache
      .record_response(&get, &response_at(200, r#"[{"id":1,"v":"old"}]"#, 100))
      .await
      .unwrap();
    assert_eq!(
      write,
      CacheWrite::Superseded {
        collection: "calls".into()
      }
    );

    let cached = cache.fallback("/api/calls").await.unwrap().unwrap();
    assert_eq!(cached.body, r#"[{"id":1,"v":"new"}]"#);
  }

  #[tokio::test]
  async fn test_refresh_drops_records_gone_upstream() {
    let cache = cache();
    let get = HttpRequest::get("/api/clients");
    cache
      .record_response(&get, &response_at(200, r#"[{"id":1},{"id":2}]"#, 1))
      .await
      .unwrap();
    cache
      .record_response(&get, &response_at(200, r#"[{"id":2}]"#, 2))
      .await
      .unwrap();

    let cached = cache.fallback("/api/clients?page=1").await.unwrap().unwrap();
    let records: Vec<Value> = serde_json::from_str(&cached.body).unwrap();
    assert_eq!(records, vec![serde_json::json!({"id": 2})]);
  }

  #[tokio::test]
  async fn test_bad_batch_keeps_previous_snapshot() {
    let cache = cache();
    let get = HttpRequest::get("/api/clients");
    cache
      .record_response(&get, &response_at(200, r#"[{"id":1}]"#, 1))
      .await
      .unwrap();

    // Second record has no key: the whole refresh is rejected
    assert!(cache
      .record_response(&get, &response_at(200, r#"[{"id":2},{"name":"?"}]"#, 2))
      .await
      .is_err());

    let cached = cache.fallback("/api/clients").await.unwrap().unwrap();
    assert_eq!(cached.body, r#"[{"id":1}]"#);
    assert_eq!(cache.metadata("clients").await.unwrap().unwrap().last_updated, 1);
  }

  #[tokio::test]
  async fn test_staleness_follows_metadata() {
    let cache = cache();
    assert!(cache.is_stale("clients", Duration::minutes(5)).await.unwrap());

    cache
      .record_response(
        &HttpRequest::get("/api/clients"),
        &HttpResponse::new(200, "[]"),
      )
      .await
      .unwrap();
    assert!(!cache.is_stale("clients", Duration::minutes(5)).await.unwrap());
    assert!(cache.is_stale("clients", Duration::milliseconds(-1)).await.unwrap());
  }
}
