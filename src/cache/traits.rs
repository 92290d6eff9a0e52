//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;

/// Identity of a cached record. Backends hand out either numeric or string ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
  Number(i64),
  Text(String),
}

impl fmt::Display for RecordId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RecordId::Number(n) => write!(f, "{}", n),
      RecordId::Text(s) => f.write_str(s),
    }
  }
}

impl From<i64> for RecordId {
  fn from(id: i64) -> Self {
    RecordId::Number(id)
  }
}

impl From<&str> for RecordId {
  fn from(id: &str) -> Self {
    RecordId::Text(id.to_string())
  }
}

impl From<String> for RecordId {
  fn from(id: String) -> Self {
    RecordId::Text(id)
  }
}

/// Trait for records that can live in a cached collection.
///
/// Records are stored as JSON, so implementors only need serde support and a
/// stable id that is unique within their collection.
pub trait Record: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Unique identifier within the collection
  fn id(&self) -> RecordId;
}

/// Result from a cache read, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data that is still fresh.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::CacheFresh,
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Offline mode - network unavailable, serving stale cached data
  Offline,
}

impl CacheSource {
  pub fn label(&self) -> &'static str {
    match self {
      CacheSource::Network => "network",
      CacheSource::CacheFresh => "cache",
      CacheSource::Offline => "offline",
    }
  }
}
