//! Client-side mirror of server-held collections.
//!
//! This module provides a backend-agnostic caching mechanism that:
//! - Stores ordered collections of records under hierarchical keys
//! - Refetches a collection from its registered fetcher on invalidation
//! - Serves a cache-first read with offline fallback to stale data
//! - Persists to SQLite so the last reconciled state survives restarts

mod key;
mod layer;
mod storage;
mod traits;

pub use key::CacheKey;
pub use layer::CacheLayer;
pub use storage::{CacheStorage, MemoryStorage, SqliteStorage};
pub use traits::{CacheResult, Record, RecordId};
