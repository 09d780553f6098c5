//! SQLite-backed local store.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::error::{StoreError, StoreResult};
use super::schema::{self, CollectionDef, IndexDef, StoreSchema, MIGRATIONS};

/// Where the store keeps its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
  File(PathBuf),
  /// Process-local store, discarded on drop
  Memory,
}

impl StoreLocation {
  /// Get the default database path.
  pub fn default_path() -> Option<PathBuf> {
    dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .map(|dir| dir.join("fieldsync").join("store.db"))
  }

  fn describe(&self) -> String {
    match self {
      Self::File(path) => path.display().to_string(),
      Self::Memory => ":memory:".to_string(),
    }
  }
}

struct StoreState {
  conn: Mutex<Connection>,
  registry: HashMap<String, CollectionDef>,
}

/// Versioned on-device store of named record collections.
///
/// The store opens lazily: the first operation (or an explicit [`init`])
/// runs the migrations, and concurrent callers wait on that same
/// initialization.
///
/// [`init`]: LocalStore::init
pub struct LocalStore {
  location: StoreLocation,
  schema: StoreSchema,
  state: OnceCell<StoreState>,
}

impl LocalStore {
  pub fn new(location: StoreLocation, schema: StoreSchema) -> Self {
    Self {
      location,
      schema,
      state: OnceCell::new(),
    }
  }

  /// In-memory store, mostly for tests and one-shot runs.
  pub fn in_memory(schema: StoreSchema) -> Self {
    Self::new(StoreLocation::Memory, schema)
  }

  pub fn location(&self) -> &StoreLocation {
    &self.location
  }

  pub fn is_initialized(&self) -> bool {
    self.state.initialized()
  }

  /// Open and upgrade the store. Safe to call repeatedly and concurrently.
  pub async fn init(&self) -> StoreResult<()> {
    self.state().await.map(|_| ())
  }

  async fn state(&self) -> StoreResult<&StoreState> {
    self.state.get_or_try_init(|| async { self.open() }).await
  }

  fn open(&self) -> StoreResult<StoreState> {
    let open_err = |reason: String| StoreError::Open {
      path: self.location.describe(),
      reason,
    };

    let mut conn = match &self.location {
      StoreLocation::File(path) => open_file(path).map_err(open_err)?,
      StoreLocation::Memory => Connection::open_in_memory().map_err(|e| open_err(e.to_string()))?,
    };

    let registry = migrate(&mut conn, &self.schema)?;
    info!(
      location = %self.location.describe(),
      collections = registry.len(),
      "local store ready"
    );

    Ok(StoreState {
      conn: Mutex::new(conn),
      registry,
    })
  }

  /// Run `f` inside a single transaction. Nothing is written unless `f`
  /// returns `Ok`.
  pub async fn transaction<R, F>(&self, f: F) -> StoreResult<R>
  where
    F: FnOnce(&StoreTx<'_>) -> StoreResult<R> + Send,
  {
    let state = self.state().await?;
    let mut conn = state.conn.lock().map_err(|_| StoreError::Poisoned)?;
    let tx = conn.transaction()?;
    let result = f(&StoreTx {
      conn: &tx,
      registry: &state.registry,
    })?;
    tx.commit()?;
    Ok(result)
  }

  /// Upsert a batch of records. Either all of them are written or none.
  pub async fn put<T: Serialize + Sync>(&self, collection: &str, records: &[T]) -> StoreResult<()> {
    self.transaction(|tx| tx.put(collection, records)).await
  }

  pub async fn put_one<T: Serialize + Sync>(&self, collection: &str, record: &T) -> StoreResult<()> {
    self.transaction(|tx| tx.put_one(collection, record)).await
  }

  pub async fn get<T: DeserializeOwned + Send>(
    &self,
    collection: &str,
    key: &str,
  ) -> StoreResult<Option<T>> {
    self.transaction(|tx| tx.get(collection, key)).await
  }

  pub async fn get_all<T: DeserializeOwned + Send>(&self, collection: &str) -> StoreResult<Vec<T>> {
    self.transaction(|tx| tx.get_all(collection)).await
  }

  pub async fn get_by_index<T: DeserializeOwned + Send>(
    &self,
    collection: &str,
    index: &str,
    value: &Value,
  ) -> StoreResult<Vec<T>> {
    self
      .transaction(|tx| tx.get_by_index(collection, index, value))
      .await
  }

  pub async fn count(&self, collection: &str) -> StoreResult<usize> {
    self.transaction(|tx| tx.count(collection)).await
  }

  pub async fn count_by_index(
    &self,
    collection: &str,
    index: &str,
    value: &Value,
  ) -> StoreResult<usize> {
    self
      .transaction(|tx| tx.count_by_index(collection, index, value))
      .await
  }

  pub async fn remove(&self, collection: &str, key: &str) -> StoreResult<bool> {
    self.transaction(|tx| tx.remove(collection, key)).await
  }

  pub async fn clear(&self, collection: &str) -> StoreResult<usize> {
    self.transaction(|tx| tx.clear(collection)).await
  }
}

fn open_file(path: &Path) -> Result<Connection, String> {
  // Ensure parent directory exists
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent).map_err(|e| format!("failed to create directory: {}", e))?;
  }

  let conn = Connection::open(path).map_err(|e| e.to_string())?;
  conn
    .busy_timeout(Duration::from_secs(5))
    .map_err(|e| e.to_string())?;
  conn
    .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
    .map_err(|e| e.to_string())?;
  Ok(conn)
}

/// Bring the engine tables up to date and register the schema's collections.
///
/// Everything here is create-if-absent: collections and indexes from older
/// schema versions stay registered.
fn migrate(
  conn: &mut Connection,
  schema: &StoreSchema,
) -> StoreResult<HashMap<String, CollectionDef>> {
  let tx = conn.transaction()?;

  let current: u32 = tx.pragma_query_value(None, "user_version", |row| row.get(0))?;
  for (i, sql) in MIGRATIONS.iter().enumerate().skip(current as usize) {
    let version = i as u32 + 1;
    tx.execute_batch(sql).map_err(|e| StoreError::Migration {
      version,
      reason: e.to_string(),
    })?;
    tx.pragma_update(None, "user_version", version)?;
    debug!(version, "applied store migration");
  }

  let stored_version: Option<u32> = tx
    .query_row(
      "SELECT value FROM store_meta WHERE key = 'schema_version'",
      [],
      |row| row.get::<_, String>(0),
    )
    .optional()?
    .and_then(|v| v.parse().ok());

  if let Some(stored) = stored_version.filter(|v| *v > schema.version) {
    warn!(
      stored,
      requested = schema.version,
      "store was written by a newer schema; keeping existing layout"
    );
  }

  for def in &schema.collections {
    let created = tx.execute(
      "INSERT OR IGNORE INTO collections (name, key_path) VALUES (?1, ?2)",
      params![def.name, def.key_path],
    )? == 1;

    if !created {
      let key_path: String = tx.query_row(
        "SELECT key_path FROM collections WHERE name = ?1",
        params![def.name],
        |row| row.get(0),
      )?;
      if key_path != def.key_path {
        warn!(
          collection = %def.name,
          stored = %key_path,
          requested = %def.key_path,
          "key path change ignored; existing records keep their keys"
        );
      }
    }

    for index in &def.indexes {
      let added = tx.execute(
        "INSERT OR IGNORE INTO collection_indexes (collection, name, key_path) VALUES (?1, ?2, ?3)",
        params![def.name, index.name, index.key_path],
      )? == 1;
      if added && !created {
        let rows = backfill_index(&tx, &def.name, index)?;
        info!(collection = %def.name, index = %index.name, rows, "backfilled new index");
      }
    }
  }

  let version = stored_version.unwrap_or(0).max(schema.version);
  tx.execute(
    "INSERT OR REPLACE INTO store_meta (key, value) VALUES ('schema_version', ?1)",
    params![version.to_string()],
  )?;

  let registry = load_registry(&tx)?;
  tx.commit()?;
  Ok(registry)
}

fn backfill_index(conn: &Connection, collection: &str, index: &IndexDef) -> StoreResult<usize> {
  let rows: Vec<(String, String)> = {
    let mut stmt = conn.prepare("SELECT record_key, data FROM records WHERE collection = ?1")?;
    let rows = stmt
      .query_map(params![collection], |row| Ok((row.get(0)?, row.get(1)?)))?
      .collect::<Result<_, _>>()?;
    rows
  };

  let mut indexed = 0;
  for (key, data) in rows {
    let record: Value = serde_json::from_str(&data)?;
    if let Some(value) = schema::value_at(&record, &index.key_path) {
      conn.execute(
        "INSERT OR REPLACE INTO record_index (collection, index_name, index_value, record_key)
         VALUES (?1, ?2, ?3, ?4)",
        params![collection, index.name, value, key],
      )?;
      indexed += 1;
    }
  }
  Ok(indexed)
}

fn load_registry(conn: &Connection) -> StoreResult<HashMap<String, CollectionDef>> {
  let mut registry: HashMap<String, CollectionDef> = HashMap::new();

  let mut stmt = conn.prepare("SELECT name, key_path FROM collections")?;
  let collections = stmt.query_map([], |row| {
    Ok(CollectionDef {
      name: row.get(0)?,
      key_path: row.get(1)?,
      indexes: Vec::new(),
    })
  })?;
  for def in collections {
    let def = def?;
    registry.insert(def.name.clone(), def);
  }

  let mut stmt = conn.prepare("SELECT collection, name, key_path FROM collection_indexes")?;
  let indexes = stmt.query_map([], |row| {
    Ok((
      row.get::<_, String>(0)?,
      IndexDef {
        name: row.get(1)?,
        key_path: row.get(2)?,
      },
    ))
  })?;
  for entry in indexes {
    let (collection, index) = entry?;
    if let Some(def) = registry.get_mut(&collection) {
      def.indexes.push(index);
    }
  }

  Ok(registry)
}

/// Operations inside one store transaction.
pub struct StoreTx<'a> {
  conn: &'a Connection,
  registry: &'a HashMap<String, CollectionDef>,
}

impl StoreTx<'_> {
  fn collection(&self, name: &str) -> StoreResult<&CollectionDef> {
    self
      .registry
      .get(name)
      .ok_or_else(|| StoreError::UnknownCollection(name.to_string()))
  }

  fn index(&self, collection: &str, index: &str) -> StoreResult<&IndexDef> {
    self
      .collection(collection)?
      .index(index)
      .ok_or_else(|| StoreError::UnknownIndex {
        collection: collection.to_string(),
        index: index.to_string(),
      })
  }

  /// Upsert records by key. A record replaces the previous value whole.
  pub fn put<T: Serialize>(&self, collection: &str, records: &[T]) -> StoreResult<()> {
    let def = self.collection(collection)?;

    let mut upsert = self.conn.prepare_cached(
      "INSERT OR REPLACE INTO records (collection, record_key, data) VALUES (?1, ?2, ?3)",
    )?;
    let mut unindex = self
      .conn
      .prepare_cached("DELETE FROM record_index WHERE collection = ?1 AND record_key = ?2")?;
    let mut index_row = self.conn.prepare_cached(
      "INSERT OR REPLACE INTO record_index (collection, index_name, index_value, record_key)
       VALUES (?1, ?2, ?3, ?4)",
    )?;

    for record in records {
      let data = serde_json::to_string(record)?;
      let value: Value = serde_json::from_str(&data)?;
      let key = schema::value_at(&value, &def.key_path).ok_or_else(|| StoreError::MissingKey {
        collection: collection.to_string(),
        key_path: def.key_path.clone(),
      })?;

      upsert.execute(params![collection, key, data])?;
      unindex.execute(params![collection, key])?;
      for index in &def.indexes {
        if let Some(indexed) = schema::value_at(&value, &index.key_path) {
          index_row.execute(params![collection, index.name, indexed, key])?;
        }
      }
    }

    Ok(())
  }

  pub fn put_one<T: Serialize>(&self, collection: &str, record: &T) -> StoreResult<()> {
    self.put(collection, std::slice::from_ref(record))
  }

  pub fn get<T: DeserializeOwned>(&self, collection: &str, key: &str) -> StoreResult<Option<T>> {
    self.collection(collection)?;

    let data: Option<String> = self
      .conn
      .prepare_cached("SELECT data FROM records WHERE collection = ?1 AND record_key = ?2")?
      .query_row(params![collection, key], |row| row.get(0))
      .optional()?;

    data
      .map(|d| serde_json::from_str(&d).map_err(StoreError::from))
      .transpose()
  }

  /// All records of a collection, in the order they were last written.
  pub fn get_all<T: DeserializeOwned>(&self, collection: &str) -> StoreResult<Vec<T>> {
    self.collection(collection)?;

    let mut stmt = self
      .conn
      .prepare_cached("SELECT data FROM records WHERE collection = ?1 ORDER BY rowid")?;
    let rows = stmt.query_map(params![collection], |row| row.get::<_, String>(0))?;
    decode_rows(rows)
  }

  pub fn get_by_index<T: DeserializeOwned>(
    &self,
    collection: &str,
    index: &str,
    value: &Value,
  ) -> StoreResult<Vec<T>> {
    self.index(collection, index)?;
    let Some(text) = schema::index_text(value) else {
      return Ok(Vec::new());
    };

    let mut stmt = self.conn.prepare_cached(
      "SELECT r.data FROM record_index i
       INNER JOIN records r ON r.collection = i.collection AND r.record_key = i.record_key
       WHERE i.collection = ?1 AND i.index_name = ?2 AND i.index_value = ?3
       ORDER BY r.rowid",
    )?;
    let rows = stmt.query_map(params![collection, index, text], |row| row.get::<_, String>(0))?;
    decode_rows(rows)
  }

  pub fn count(&self, collection: &str) -> StoreResult<usize> {
    self.collection(collection)?;
    let count: i64 = self.conn.query_row(
      "SELECT COUNT(*) FROM records WHERE collection = ?1",
      params![collection],
      |row| row.get(0),
    )?;
    Ok(count as usize)
  }

  pub fn count_by_index(&self, collection: &str, index: &str, value: &Value) -> StoreResult<usize> {
    self.index(collection, index)?;
    let Some(text) = schema::index_text(value) else {
      return Ok(0);
    };

    let count: i64 = self.conn.query_row(
      "SELECT COUNT(*) FROM record_index
       WHERE collection = ?1 AND index_name = ?2 AND index_value = ?3",
      params![collection, index, text],
      |row| row.get(0),
    )?;
    Ok(count as usize)
  }

  /// Delete one record. Returns whether it existed.
  pub fn remove(&self, collection: &str, key: &str) -> StoreResult<bool> {
    self.collection(collection)?;
    self.conn.execute(
      "DELETE FROM record_index WHERE collection = ?1 AND record_key = ?2",
      params![collection, key],
    )?;
    let removed = self.conn.execute(
      "DELETE FROM records WHERE collection = ?1 AND record_key = ?2",
      params![collection, key],
    )?;
    Ok(removed > 0)
  }

  /// Delete every record of a collection. Returns how many were removed.
  pub fn clear(&self, collection: &str) -> StoreResult<usize> {
    self.collection(collection)?;
    self.conn.execute(
      "DELETE FROM record_index WHERE collection = ?1",
      params![collection],
    )?;
    let removed = self
      .conn
      .execute("DELETE FROM records WHERE collection = ?1", params![collection])?;
    Ok(removed)
  }
}

fn decode_rows<T, I>(rows: I) -> StoreResult<Vec<T>>
where
  T: DeserializeOwned,
  I: Iterator<Item = rusqlite::Result<String>>,
{
  rows
    .map(|row| {
      let data = row?;
      serde_json::from_str(&data).map_err(StoreError::from)
    })
    .collect()
}
