use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::CacheRoute;
use crate::store::{CollectionDef, IndexDef, StoreLocation, StoreSchema, CACHE_METADATA, SYNC_QUEUE};
use crate::sync::RetryPolicy;

/// Overrides `server.base_url`
pub const SERVER_URL_ENV: &str = "FIELDSYNC_SERVER_URL";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub server: ServerConfig,
  #[serde(default)]
  pub store: StoreConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  /// Collections mirrored from list endpoints
  #[serde(default)]
  pub collections: Vec<CollectionConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  pub base_url: String,
  /// Path probed to detect connectivity
  #[serde(default = "default_health_path")]
  pub health_path: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
  /// Database file (defaults to the user data directory)
  pub path: Option<PathBuf>,
  /// Version of the collection layout below. Bump it when adding
  /// collections or indexes.
  #[serde(default = "default_schema_version")]
  pub schema_version: u32,
}

impl Default for StoreConfig {
  fn default() -> Self {
    Self {
      path: None,
      schema_version: default_schema_version(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  #[serde(default = "default_periodic_interval_secs")]
  pub periodic_interval_secs: u64,
  /// Wait before retry n is `backoff_secs[n - 1]`
  #[serde(default = "default_backoff_secs")]
  pub backoff_secs: Vec<u64>,
  #[serde(default = "default_max_retries")]
  pub max_retries: u32,
  #[serde(default = "default_reconnect_grace_ms")]
  pub reconnect_grace_ms: u64,
  #[serde(default = "default_probe_interval_secs")]
  pub probe_interval_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      periodic_interval_secs: default_periodic_interval_secs(),
      backoff_secs: default_backoff_secs(),
      max_retries: default_max_retries(),
      reconnect_grace_ms: default_reconnect_grace_ms(),
      probe_interval_secs: default_probe_interval_secs(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectionConfig {
  pub name: String,
  /// List endpoint whose responses fill this collection
  pub route: Option<String>,
  #[serde(default = "default_key_path")]
  pub key_path: String,
  #[serde(default)]
  pub indexes: Vec<IndexDef>,
}

fn default_health_path() -> String {
  "/health".to_string()
}

fn default_timeout_secs() -> u64 {
  30
}

fn default_schema_version() -> u32 {
  1
}

fn default_periodic_interval_secs() -> u64 {
  30
}

fn default_backoff_secs() -> Vec<u64> {
  vec![1, 5, 15]
}

fn default_max_retries() -> u32 {
  3
}

fn default_reconnect_grace_ms() -> u64 {
  2000
}

fn default_probe_interval_secs() -> u64 {
  10
}

fn default_key_path() -> String {
  "id".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./fieldsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/fieldsync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => {
        return Err(eyre!(
          "No configuration file found. Create one at ~/.config/fieldsync/config.yaml\n\
                 See fieldsync.example.yaml for the format."
        ))
      }
    };
    config.apply_overrides(|name| std::env::var(name).ok());
    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("fieldsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("fieldsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  /// Apply environment overrides. `var` looks a variable up by name.
  pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
    if let Some(url) = var(SERVER_URL_ENV).filter(|u| !u.trim().is_empty()) {
      self.server.base_url = url;
    }
  }

  pub fn validate(&self) -> Result<()> {
    Url::parse(&self.server.base_url)
      .map_err(|e| eyre!("Invalid server.base_url {:?}: {}", self.server.base_url, e))?;

    if self.sync.backoff_secs.is_empty() {
      return Err(eyre!("sync.backoff_secs must list at least one delay"));
    }
    if self.sync.periodic_interval_secs == 0 || self.sync.probe_interval_secs == 0 {
      return Err(eyre!("sync intervals must be at least one second"));
    }

    let mut names = BTreeSet::new();
    let mut routes = BTreeSet::new();
    for collection in &self.collections {
      if collection.name == SYNC_QUEUE || collection.name == CACHE_METADATA {
        return Err(eyre!("Collection name {:?} is reserved", collection.name));
      }
      if !names.insert(collection.name.as_str()) {
        return Err(eyre!("Collection {:?} is declared twice", collection.name));
      }
      if let Some(route) = &collection.route {
        if !route.starts_with('/') {
          return Err(eyre!(
            "Route {:?} of collection {:?} must start with '/'",
            route,
            collection.name
          ));
        }
        if !routes.insert(route.trim_end_matches('/')) {
          return Err(eyre!("Route {:?} is mapped to two collections", route));
        }
      }
    }
    Ok(())
  }

  pub fn store_schema(&self) -> StoreSchema {
    self
      .collections
      .iter()
      .fold(StoreSchema::new(self.store.schema_version), |schema, c| {
        schema.with_collection(CollectionDef {
          name: c.name.clone(),
          key_path: c.key_path.clone(),
          indexes: c.indexes.clone(),
        })
      })
  }

  pub fn cache_routes(&self) -> Vec<CacheRoute> {
    self
      .collections
      .iter()
      .filter_map(|c| {
        c.route.as_ref().map(|path| CacheRoute {
          path: path.clone(),
          collection: c.name.clone(),
        })
      })
      .collect()
  }

  pub fn store_location(&self) -> Result<StoreLocation> {
    match &self.store.path {
      Some(path) => Ok(StoreLocation::File(path.clone())),
      None => StoreLocation::default_path()
        .map(StoreLocation::File)
        .ok_or_else(|| eyre!("No data directory available; set store.path")),
    }
  }

  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy {
      max_retries: self.sync.max_retries,
      backoff: self
        .sync
        .backoff_secs
        .iter()
        .map(|s| Duration::from_secs(*s))
        .collect(),
    }
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.server.timeout_secs)
  }

  pub fn periodic_interval(&self) -> Duration {
    Duration::from_secs(self.sync.periodic_interval_secs)
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.sync.probe_interval_secs)
  }

  pub fn reconnect_grace(&self) -> Duration {
    Duration::from_millis(self.sync.reconnect_grace_ms)
  }
}
