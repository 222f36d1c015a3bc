use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::db;
use crate::store::EntityStore;

/// Settings key holding the operator name
pub const OPERATOR_SETTING: &str = "operator";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  /// Path of the entity database (default: $XDG_DATA_HOME/wellsync/wells.db)
  pub database: Option<PathBuf>,
  /// Operator recorded on samples when no other source provides one
  pub operator: Option<String>,
  #[serde(default)]
  pub remote: RemoteConfig,
  #[serde(default)]
  pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
  pub url: String,
  pub wells_endpoint: String,
  pub duplicates_endpoint: String,
  /// Probed to detect connectivity
  pub health_endpoint: String,
  pub timeout_secs: u64,
}

impl Default for RemoteConfig {
  fn default() -> Self {
    Self {
      url: "http://127.0.0.1:8080".to_string(),
      wells_endpoint: "/api/samples".to_string(),
      duplicates_endpoint: "/api/duplicates".to_string(),
      health_endpoint: "/api/health".to_string(),
      timeout_secs: 15,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
  /// Suffix of the precache generation; bump to replace the app shell
  pub cache_version: String,
  /// Origin serving the application shell
  pub origin: String,
  /// Address of the local caching proxy, disabled when unset
  pub listen: Option<String>,
  /// App shell paths fetched on install
  pub precache: Vec<String>,
  /// Requests under this prefix are served network-first
  pub api_prefix: String,
  /// Path fragments that are never intercepted
  pub excluded_paths: Vec<String>,
  pub probe_interval_secs: u64,
  /// Periodic sync in addition to reconnect and manual triggers, 0 disables
  pub sync_interval_secs: u64,
  pub fetch_timeout_secs: u64,
  /// Activate a freshly installed version without waiting for the console
  pub skip_waiting: bool,
}

impl Default for WorkerConfig {
  fn default() -> Self {
    Self {
      cache_version: "v1".to_string(),
      origin: "http://127.0.0.1:8080".to_string(),
      listen: None,
      precache: [
        "/",
        "/index.html",
        "/offline.html",
        "/manifest.json",
        "/styles/main.css",
        "/js/app.js",
      ]
      .iter()
      .map(|s| s.to_string())
      .collect(),
      api_prefix: "/api/".to_string(),
      excluded_paths: vec!["/api/internal".to_string()],
      probe_interval_secs: 30,
      sync_interval_secs: 0,
      fetch_timeout_secs: 10,
      skip_waiting: true,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./wellsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/wellsync/config.yaml
  ///
  /// Falls back to built-in defaults when no file exists.
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

    match path {
      Some(p) => Self::load_from_path(&p),
      None => {
        tracing::debug!("no configuration file found, using defaults");
        Ok(Self::default())
      }
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("wellsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("wellsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(p) => Ok(p.clone()),
      None => Ok(db::Database::default_path()?),
    }
  }

  /// Cache generations live next to the entity database, in their own file.
  pub fn cache_path(&self) -> Result<PathBuf> {
    let db_path = self.database_path()?;
    let dir = db_path
      .parent()
      .map(Path::to_path_buf)
      .unwrap_or_else(|| PathBuf::from("."));
    Ok(dir.join("cache.db"))
  }

  /// Resolve the operator name.
  ///
  /// Checks WELLSYNC_OPERATOR, then the settings table, then the config file.
  pub async fn operator(&self, store: &EntityStore) -> Result<String> {
    if let Ok(name) = std::env::var("WELLSYNC_OPERATOR") {
      if !name.trim().is_empty() {
        return Ok(name);
      }
    }

    if let Some(serde_json::Value::String(name)) = store.setting(OPERATOR_SETTING).await? {
      return Ok(name);
    }

    self.operator.clone().ok_or_else(|| {
      eyre!(
        "No operator configured. Pass --operator, set WELLSYNC_OPERATOR, \
         or run `wellsync settings set operator <name>`."
      )
    })
  }
}
