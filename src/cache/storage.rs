//! Cache storage trait with in-memory and SQLite implementations.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::key::CacheKey;
use super::traits::Record;

/// A cached collection together with the time it was written.
#[derive(Debug, Clone)]
pub struct CachedCollection<T> {
  /// The cached records in order
  pub records: Vec<T>,
  /// When the collection was stored
  pub cached_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// Every write replaces the whole collection, so readers never observe a
/// partially applied mutation.
pub trait CacheStorage: Send + Sync + 'static {
  /// Replace the collection stored under `key`, stamped with `cached_at`.
  fn store_collection<T: Record>(
    &self,
    key: &CacheKey,
    records: &[T],
    cached_at: DateTime<Utc>,
  ) -> Result<()>;

  /// Get the collection stored under `key`.
  fn get_collection<T: Record>(&self, key: &CacheKey) -> Result<Option<CachedCollection<T>>>;

  /// Drop the collection stored under `key`. Missing keys are not an error.
  fn remove_collection(&self, key: &CacheKey) -> Result<()>;
}

/// Process-local storage. Used by tests and when persistence is disabled.
#[derive(Default)]
pub struct MemoryStorage {
  collections: Mutex<HashMap<CacheKey, (Vec<Value>, DateTime<Utc>)>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }
}

impl CacheStorage for MemoryStorage {
  fn store_collection<T: Record>(
    &self,
    key: &CacheKey,
    records: &[T],
    cached_at: DateTime<Utc>,
  ) -> Result<()> {
    let values = records
      .iter()
      .map(serde_json::to_value)
      .collect::<Result<Vec<_>, _>>()
      .map_err(|e| eyre!("Failed to serialize record for {}: {}", key, e))?;

    self
      .collections
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .insert(key.clone(), (values, cached_at));
    Ok(())
  }

  fn get_collection<T: Record>(&self, key: &CacheKey) -> Result<Option<CachedCollection<T>>> {
    let collections = self
      .collections
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let Some((values, cached_at)) = collections.get(key) else {
      return Ok(None);
    };

    let records = values
      .iter()
      .cloned()
      .map(serde_json::from_value)
      .collect::<Result<Vec<T>, _>>()
      .map_err(|e| eyre!("Failed to deserialize record for {}: {}", key, e))?;

    Ok(Some(CachedCollection {
      records,
      cached_at: *cached_at,
    }))
  }

  fn remove_collection(&self, key: &CacheKey) -> Result<()> {
    self
      .collections
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .remove(key);
    Ok(())
  }
}

/// SQLite-based cache storage. Survives restarts, which gives the CLI an
/// offline view of the last reconciled state.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Create a new SQLite storage at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Create a new SQLite storage at an explicit path.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  #[cfg(test)]
  pub fn in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory cache: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("hubsync").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- One row per cached collection
CREATE TABLE IF NOT EXISTS collection_cache (
    key_hash TEXT PRIMARY KEY,
    key_path TEXT NOT NULL,
    cached_at TEXT NOT NULL,
    record_count INTEGER NOT NULL
);

-- Records of a collection (preserves order)
CREATE TABLE IF NOT EXISTS collection_records (
    key_hash TEXT NOT NULL,
    position INTEGER NOT NULL,
    record_id TEXT NOT NULL,
    data BLOB NOT NULL,
    PRIMARY KEY (key_hash, position),
    FOREIGN KEY (key_hash) REFERENCES collection_cache(key_hash) ON DELETE CASCADE
);
"#;

impl CacheStorage for SqliteStorage {
  fn store_collection<T: Record>(
    &self,
    key: &CacheKey,
    records: &[T],
    cached_at: DateTime<Utc>,
  ) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let key_hash = key.cache_hash();

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM collection_records WHERE key_hash = ?",
      params![key_hash],
    )
    .map_err(|e| eyre!("Failed to delete old records: {}", e))?;

    tx.execute(
      "INSERT OR REPLACE INTO collection_cache (key_hash, key_path, cached_at, record_count)
       VALUES (?, ?, ?, ?)",
      params![
        key_hash,
        key.to_string(),
        cached_at.to_rfc3339(),
        records.len()
      ],
    )
    .map_err(|e| eyre!("Failed to update collection cache: {}", e))?;

    for (position, record) in records.iter().enumerate() {
      let data =
        serde_json::to_vec(record).map_err(|e| eyre!("Failed to serialize record: {}", e))?;

      tx.execute(
        "INSERT INTO collection_records (key_hash, position, record_id, data)
         VALUES (?, ?, ?, ?)",
        params![key_hash, position, record.id().to_string(), data],
      )
      .map_err(|e| eyre!("Failed to store record: {}", e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn get_collection<T: Record>(&self, key: &CacheKey) -> Result<Option<CachedCollection<T>>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let key_hash = key.cache_hash();

    let mut stmt = conn
      .prepare("SELECT cached_at FROM collection_cache WHERE key_hash = ?")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let cached_at: Option<String> = stmt
      .query_row(params![key_hash], |row| row.get(0))
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry for {}: {}", key, e))?;

    let Some(cached_at) = cached_at else {
      return Ok(None);
    };
    let cached_at = parse_datetime(&cached_at)?;

    let mut stmt = conn
      .prepare(
        "SELECT data FROM collection_records
         WHERE key_hash = ?
         ORDER BY position",
      )
      .map_err(|e| eyre!("Failed to prepare record query: {}", e))?;

    let rows: Vec<Vec<u8>> = stmt
      .query_map(params![key_hash], |row| row.get(0))
      .map_err(|e| eyre!("Failed to query records: {}", e))?
      .collect::<Result<_, _>>()
      .map_err(|e| eyre!("Failed to read record row: {}", e))?;

    let records = rows
      .iter()
      .map(|data| serde_json::from_slice(data))
      .collect::<Result<Vec<T>, _>>()
      .map_err(|e| eyre!("Failed to deserialize record for {}: {}", key, e))?;

    Ok(Some(CachedCollection { records, cached_at }))
  }

  fn remove_collection(&self, key: &CacheKey) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "DELETE FROM collection_cache WHERE key_hash = ?",
        params![key.cache_hash()],
      )
      .map_err(|e| eyre!("Failed to remove collection {}: {}", key, e))?;

    Ok(())
  }
}

/// Parse a timestamp written by `store_collection`.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
