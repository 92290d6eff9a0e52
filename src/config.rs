use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::CacheKey;
use crate::retry::RetryPolicy;
use crate::sync::SyncOptions;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub backend: BackendConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub retry: RetryConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
  /// Base URL of the REST API, e.g. http://localhost:5000/api
  pub url: String,
  pub timeout_secs: u64,
}

impl Default for BackendConfig {
  fn default() -> Self {
    Self {
      url: "http://localhost:5000/api".to_string(),
      timeout_secs: 30,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub interval_secs: u64,
  /// Raise overdue-task alerts after each sync
  pub notifications: bool,
  /// Collections refetched on every sync (slash separated cache keys)
  pub keys: Vec<String>,
}

impl Default for SyncConfig {
  fn default() -> Self {
    let defaults = SyncOptions::default();
    Self {
      interval_secs: defaults.interval.as_secs(),
      notifications: defaults.notifications_enabled,
      keys: defaults.keys.iter().map(ToString::to_string).collect(),
    }
  }
}

impl SyncConfig {
  pub fn options(&self) -> SyncOptions {
    SyncOptions {
      interval: Duration::from_secs(self.interval_secs.max(1)),
      keys: self.keys.iter().map(|k| CacheKey::parse(k)).collect(),
      notifications_enabled: self.notifications,
      ..SyncOptions::default()
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  pub max_attempts: u32,
  pub base_delay_ms: u64,
  pub exponential: bool,
}

impl Default for RetryConfig {
  fn default() -> Self {
    let defaults = RetryPolicy::default();
    Self {
      max_attempts: defaults.max_attempts,
      base_delay_ms: defaults.base_delay.as_millis() as u64,
      exponential: defaults.exponential,
    }
  }
}

impl RetryConfig {
  pub fn policy(&self) -> RetryPolicy {
    RetryPolicy {
      max_attempts: self.max_attempts,
      base_delay: Duration::from_millis(self.base_delay_ms),
      exponential: self.exponential,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Keep the cache in SQLite between runs
  pub persist: bool,
  /// Database location (default: $XDG_DATA_HOME/hubsync/cache.db)
  pub path: Option<PathBuf>,
  /// Age after which cached collections are refetched on read
  pub stale_secs: i64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      persist: true,
      path: None,
      stale_secs: 300,
    }
  }
}

impl CacheConfig {
  pub fn stale_time(&self) -> Result<chrono::Duration> {
    if self.stale_secs < 0 {
      return Err(eyre!("cache.stale_secs must not be negative, got {}", self.stale_secs));
    }
    chrono::Duration::try_seconds(self.stale_secs)
      .ok_or_else(|| eyre!("cache.stale_secs is out of range: {}", self.stale_secs))
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Directory for the rolling log file (default: $XDG_DATA_HOME/hubsync/logs)
  pub directory: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./hubsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/hubsync/config.yaml
  ///
  /// Without any file the built-in defaults are used.
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
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("hubsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("hubsync").join("config.yaml");
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

  fn parse(contents: &str) -> Result<Self> {
    // An empty file is a valid, all-defaults config
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// Get the backend API token from the environment, if any.
  ///
  /// Checks HUBSYNC_API_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("HUBSYNC_API_TOKEN")
      .ok()
      .filter(|t| !t.trim().is_empty())
  }
}
