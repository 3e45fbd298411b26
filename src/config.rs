use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::TtlPolicy;
use crate::sync::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// User owning the dashboards and the cache entries
  #[serde(default = "default_user_id")]
  pub user_id: String,
  #[serde(default)]
  pub store: StoreConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      user_id: default_user_id(),
      store: StoreConfig::default(),
      cache: CacheConfig::default(),
      sync: SyncConfig::default(),
    }
  }
}

fn default_user_id() -> String {
  "local".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
  /// SQLite database file (defaults to <data_dir>/dashsync/store.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
  /// Persistent cache next to the store
  #[default]
  Sqlite,
  /// Process-local, gone on exit
  Memory,
  /// Caching disabled; every read goes to the store
  None,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  #[serde(default)]
  pub backend: CacheBackendKind,
  /// SQLite cache file (defaults to <data_dir>/dashsync/cache.db)
  pub path: Option<PathBuf>,
  #[serde(default = "default_namespace")]
  pub namespace: String,
  #[serde(default)]
  pub ttl: TtlConfig,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      backend: CacheBackendKind::default(),
      path: None,
      namespace: default_namespace(),
      ttl: TtlConfig::default(),
    }
  }
}

fn default_namespace() -> String {
  "dashsync".to_string()
}

/// TTL tiers in seconds.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TtlConfig {
  pub widget_data: u64,
  pub widget_list: u64,
  pub dashboard_list: u64,
  pub file_list: u64,
}

impl Default for TtlConfig {
  fn default() -> Self {
    Self {
      widget_data: 300,
      widget_list: 600,
      dashboard_list: 600,
      file_list: 3600,
    }
  }
}

impl TtlConfig {
  pub fn policy(&self) -> TtlPolicy {
    TtlPolicy {
      widget_data: Duration::from_secs(self.widget_data),
      widget_list: Duration::from_secs(self.widget_list),
      dashboard_list: Duration::from_secs(self.dashboard_list),
      file_list: Duration::from_secs(self.file_list),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Quiet period before queued edits are flushed
  #[serde(default = "default_debounce_ms")]
  pub debounce_ms: u64,
  #[serde(default)]
  pub retry: RetryPolicy,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      debounce_ms: default_debounce_ms(),
      retry: RetryPolicy::default(),
    }
  }
}

fn default_debounce_ms() -> u64 {
  1000
}

impl SyncConfig {
  pub fn debounce(&self) -> Duration {
    Duration::from_millis(self.debounce_ms)
  }
}

impl Config {
  /// Load configuration.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./dashsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/dashsync/config.yaml
  ///
  /// Without a config file the defaults are used.
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
      None => Self::default(),
    };
    config.apply_env();
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("dashsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("dashsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    // An empty file is a valid, all-defaults config
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents)
  }

  /// DASHSYNC_USER overrides the configured user.
  fn apply_env(&mut self) {
    if let Ok(user) = std::env::var("DASHSYNC_USER") {
      if !user.trim().is_empty() {
        self.user_id = user.trim().to_string();
      }
    }
  }

  /// Directory for the default database files and logs.
  pub fn data_dir() -> Result<PathBuf> {
    let dir = dirs::data_local_dir()
      .ok_or_else(|| eyre!("Could not determine local data directory"))?
      .join("dashsync");
    std::fs::create_dir_all(&dir)
      .map_err(|e| eyre!("Failed to create data directory {}: {}", dir.display(), e))?;
    Ok(dir)
  }

  pub fn store_path(&self) -> Result<PathBuf> {
    match &self.store.path {
      Some(p) => Ok(p.clone()),
      None => Ok(Self::data_dir()?.join("store.db")),
    }
  }

  pub fn cache_path(&self) -> Result<PathBuf> {
    match &self.cache.path {
      Some(p) => Ok(p.clone()),
      None => Ok(Self::data_dir()?.join("cache.db")),
    }
  }
}
