//! Collection layout and schema migrations for the local store.

use serde::Deserialize;
use serde_json::Value;

/// Collection holding captured mutations awaiting replay.
pub const SYNC_QUEUE: &str = "sync_queue";

/// Collection holding one freshness record per cached collection.
pub const CACHE_METADATA: &str = "cache_metadata";

/// A secondary lookup index over a JSON field of each record.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IndexDef {
  pub name: String,
  pub key_path: String,
}

impl IndexDef {
  pub fn new(name: &str, key_path: &str) -> Self {
    Self {
      name: name.to_string(),
      key_path: key_path.to_string(),
    }
  }
}

/// A named collection of records keyed by a JSON field.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CollectionDef {
  pub name: String,
  /// Dotted path of the primary key inside each record (e.g. "id")
  #[serde(default = "default_key_path")]
  pub key_path: String,
  #[serde(default)]
  pub indexes: Vec<IndexDef>,
}

fn default_key_path() -> String {
  "id".to_string()
}

impl CollectionDef {
  pub fn new(name: &str, key_path: &str) -> Self {
    Self {
      name: name.to_string(),
      key_path: key_path.to_string(),
      indexes: Vec::new(),
    }
  }

  pub fn with_index(mut self, name: &str, key_path: &str) -> Self {
    self.indexes.push(IndexDef::new(name, key_path));
    self
  }

  pub fn index(&self, name: &str) -> Option<&IndexDef> {
    self.indexes.iter().find(|i| i.name == name)
  }
}

/// The application's declared collections, versioned.
///
/// Bumping `version` registers any new collections and indexes. Existing
/// collections are never dropped.
#[derive(Debug, Clone)]
pub struct StoreSchema {
  pub version: u32,
  pub collections: Vec<CollectionDef>,
}

impl StoreSchema {
  /// Schema with the engine's own collections registered.
  pub fn new(version: u32) -> Self {
    Self {
      version,
      collections: vec![
        CollectionDef::new(SYNC_QUEUE, "id")
          .with_index("status", "status")
          .with_index("timestamp", "timestamp"),
        CollectionDef::new(CACHE_METADATA, "collection"),
      ],
    }
  }

  pub fn with_collection(mut self, def: CollectionDef) -> Self {
    match self.collections.iter_mut().find(|c| c.name == def.name) {
      Some(existing) => {
        for index in def.indexes {
          if existing.index(&index.name).is_none() {
            existing.indexes.push(index);
          }
        }
      }
      None => self.collections.push(def),
    }
    self
  }

  pub fn collection(&self, name: &str) -> Option<&CollectionDef> {
    self.collections.iter().find(|c| c.name == name)
  }
}

/// Engine table migrations, applied in order and tracked by `user_version`.
pub(crate) const MIGRATIONS: &[&str] = &[
  r#"
-- Registered collections and their key paths
CREATE TABLE IF NOT EXISTS collections (
    name TEXT PRIMARY KEY,
    key_path TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS collection_indexes (
    collection TEXT NOT NULL,
    name TEXT NOT NULL,
    key_path TEXT NOT NULL,
    PRIMARY KEY (collection, name)
);

-- Records are stored as the JSON text they were written with
CREATE TABLE IF NOT EXISTS records (
    collection TEXT NOT NULL,
    record_key TEXT NOT NULL,
    data TEXT NOT NULL,
    PRIMARY KEY (collection, record_key)
);

CREATE TABLE IF NOT EXISTS record_index (
    collection TEXT NOT NULL,
    index_name TEXT NOT NULL,
    index_value TEXT NOT NULL,
    record_key TEXT NOT NULL,
    PRIMARY KEY (collection, index_name, record_key)
);

CREATE INDEX IF NOT EXISTS idx_record_index_lookup
    ON record_index(collection, index_name, index_value);

CREATE TABLE IF NOT EXISTS store_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#,
];

/// Resolve a dotted path inside a JSON record to its index text.
///
/// Strings, numbers and booleans are indexable. Missing, null and composite
/// values are not.
pub(crate) fn value_at(record: &Value, path: &str) -> Option<String> {
  let mut current = record;
  for segment in path.split('.') {
    current = current.get(segment)?;
  }
  index_text(current)
}

pub(crate) fn index_text(value: &Value) -> Option<String> {
  match value {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    Value::Bool(b) => Some(b.to_string()),
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_value_at_nested_path() {
    let record = json!({"id": 7, "owner": {"email": "ana@example.com"}});
    assert_eq!(value_at(&record, "id").as_deref(), Some("7"));
    assert_eq!(
      value_at(&record, "owner.email").as_deref(),
      Some("ana@example.com")
    );
    assert_eq!(value_at(&record, "owner.phone"), None);
  }

  #[test]
  fn test_composite_values_are_not_indexable() {
    let record = json!({"tags": ["a"], "meta": {}, "gone": null});
    assert_eq!(value_at(&record, "tags"), None);
    assert_eq!(value_at(&record, "meta"), None);
    assert_eq!(value_at(&record, "gone"), None);
  }

  #[test]
  fn test_with_collection_merges_indexes() {
    let schema = StoreSchema::new(1)
      .with_collection(CollectionDef::new("clients", "id").with_index("city", "city"))
      .with_collection(CollectionDef::new("clients", "id").with_index("owner", "owner_id"));

    let clients = schema.collection("clients").unwrap();
    assert_eq!(clients.indexes.len(), 2);
    assert!(schema.collection(SYNC_QUEUE).is_some());
  }
}
