//! Cache layer that orchestrates caching logic with network fetching.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use super::key::CacheKey;
use crate::clock::{Clock, SystemClock};
use super::storage::CacheStorage;
use super::traits::{CacheResult, Record};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Type-erased refetch: runs the registered fetcher and writes its result
/// into storage under the given key, stamped by the clock.
type RefetchFn<S> =
  Arc<dyn Fn(Arc<S>, Arc<dyn Clock>, CacheKey) -> BoxFuture<Result<()>> + Send + Sync>;

/// Cache layer that manages caching logic and network fetching.
///
/// This layer sits between the application and the backend client. Each
/// collection key can have a fetcher registered; `invalidate` uses it to
/// pull the authoritative collection from the backend.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  fetchers: Arc<RwLock<HashMap<CacheKey, RefetchFn<S>>>>,
  /// How long before cached data is considered stale
  stale_time: Duration,
  clock: Arc<dyn Clock>,
}

impl<S: CacheStorage> CacheLayer<S> {
  /// Create a new cache layer with the given storage backend.
  pub fn new(storage: S) -> Self {
    Self {
      storage: Arc::new(storage),
      fetchers: Arc::new(RwLock::new(HashMap::new())),
      stale_time: Duration::minutes(5),
      clock: Arc::new(SystemClock),
    }
  }

  /// Set the stale time for cached data.
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  /// Use `clock` for write timestamps and staleness checks.
  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// Check if cached data is stale based on cached_at timestamp.
  fn is_stale(&self, cached_at: DateTime<Utc>) -> bool {
    self.clock.now() - cached_at > self.stale_time
  }

  /// Bind a backend fetcher to a collection key, replacing any previous one.
  pub fn register<T, F, Fut>(&self, key: CacheKey, fetcher: F) -> Result<()>
  where
    T: Record,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<T>>> + Send + 'static,
  {
    let refetch: RefetchFn<S> =
      Arc::new(move |storage: Arc<S>, clock: Arc<dyn Clock>, key: CacheKey| {
        let fut = fetcher();
        Box::pin(async move {
          let records = fut.await?;
          storage.store_collection(&key, &records, clock.now())
        })
      });

    self
      .fetchers
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .insert(key, refetch);
    Ok(())
  }

  /// Read a collection. `None` when nothing was ever cached under `key`.
  pub fn get<T: Record>(&self, key: &CacheKey) -> Result<Option<Vec<T>>> {
    Ok(
      self
        .storage
        .get_collection::<T>(key)?
        .map(|cached| cached.records),
    )
  }

  /// Replace a collection.
  pub fn set<T: Record>(&self, key: &CacheKey, records: &[T]) -> Result<()> {
    self.storage.store_collection(key, records, self.clock.now())
  }

  /// Replace a collection with a function of its current value (empty when
  /// absent) and return what was written.
  pub fn update<T, F>(&self, key: &CacheKey, f: F) -> Result<Vec<T>>
  where
    T: Record,
    F: FnOnce(Vec<T>) -> Vec<T>,
  {
    let current = self.get::<T>(key)?.unwrap_or_default();
    let next = f(current);
    self.storage.store_collection(key, &next, self.clock.now())?;
    Ok(next)
  }

  /// Drop a collection from the cache.
  pub fn remove(&self, key: &CacheKey) -> Result<()> {
    self.storage.remove_collection(key)
  }

  /// Refetch a collection from the backend and overwrite the cached copy.
  pub async fn invalidate(&self, key: &CacheKey) -> Result<()> {
    let refetch = self
      .fetchers
      .read()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .get(key)
      .cloned()
      .ok_or_else(|| eyre!("No fetcher registered for {}", key))?;

    debug!(%key, "invalidating cache entry");
    refetch(Arc::clone(&self.storage), Arc::clone(&self.clock), key.clone()).await
  }

  /// Fetch a collection with cache-first strategy.
  ///
  /// 1. Check cache - if fresh, return immediately
  /// 2. If stale/missing, refetch from the backend
  /// 3. On network failure, return stale cache (offline mode)
  pub async fn fetch_collection<T: Record>(&self, key: &CacheKey) -> Result<CacheResult<Vec<T>>> {
    if let Some(cached) = self.storage.get_collection::<T>(key)? {
      if !self.is_stale(cached.cached_at) {
        return Ok(CacheResult::from_cache(cached.records, cached.cached_at));
      }

      return match self.invalidate(key).await {
        Ok(()) => {
          let records = self.get::<T>(key)?.unwrap_or_default();
          Ok(CacheResult::from_network(records))
        }
        Err(e) => {
          warn!(%key, error = %e, "refetch failed, serving stale cache");
          Ok(CacheResult::offline(cached.records, cached.cached_at))
        }
      };
    }

    // No cache, must fetch from network
    self.invalidate(key).await?;
    let records = self.get::<T>(key)?.unwrap_or_default();
    Ok(CacheResult::from_network(records))
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      fetchers: Arc::clone(&self.fetchers),
      stale_time: self.stale_time,
      clock: Arc::clone(&self.clock),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::MemoryStorage;
  use crate::cache::traits::{CacheSource, RecordId};
  use crate::clock::ManualClock;
  use serde::{Deserialize, Serialize};
  use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Item {
    id: i64,
  }

  impl Record for Item {
    fn id(&self) -> RecordId {
      RecordId::Number(self.id)
    }
  }

  fn key() -> CacheKey {
    CacheKey::from("items")
  }

  #[tokio::test]
  async fn test_invalidate_without_fetcher_fails() {
    let cache = CacheLayer::new(MemoryStorage::new());
    assert!(cache.invalidate(&key()).await.is_err());
  }

  #[tokio::test]
  async fn test_invalidate_overwrites_local_state() {
    let cache = CacheLayer::new(MemoryStorage::new());
    cache.set(&key(), &[Item { id: 99 }]).unwrap();
    cache
      .register(key(), || async { Ok(vec![Item { id: 1 }, Item { id: 2 }]) })
      .unwrap();

    cache.invalidate(&key()).await.unwrap();
    assert_eq!(
      cache.get::<Item>(&key()).unwrap().unwrap(),
      vec![Item { id: 1 }, Item { id: 2 }]
    );
  }

  #[tokio::test]
  async fn test_update_starts_from_empty() {
    let cache = CacheLayer::new(MemoryStorage::new());
    let written = cache
      .update::<Item, _>(&key(), |mut items| {
        items.push(Item { id: 5 });
        items
      })
      .unwrap();
    assert_eq!(written, vec![Item { id: 5 }]);
  }

  #[tokio::test]
  async fn test_fetch_collection_fresh_cache_skips_network() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let cache = CacheLayer::new(MemoryStorage::new());
    cache
      .register(key(), move || {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok(vec![Item { id: 1 }]) }
      })
      .unwrap();

    let first = cache.fetch_collection::<Item>(&key()).await.unwrap();
    assert_eq!(first.source, CacheSource::Network);

    let second = cache.fetch_collection::<Item>(&key()).await.unwrap();
    assert_eq!(second.source, CacheSource::CacheFresh);
    assert_eq!(second.data, vec![Item { id: 1 }]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_fetch_collection_offline_fallback() {
    let online = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&online);
    let cache = CacheLayer::new(MemoryStorage::new()).with_stale_time(Duration::zero());
    cache
      .register(key(), move || {
        let online = flag.load(Ordering::SeqCst);
        async move {
          if online {
            Ok(vec![Item { id: 1 }])
          } else {
            Err(eyre!("connection refused"))
          }
        }
      })
      .unwrap();

    cache.fetch_collection::<Item>(&key()).await.unwrap();
    online.store(false, Ordering::SeqCst);

    let result = cache.fetch_collection::<Item>(&key()).await.unwrap();
    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data, vec![Item { id: 1 }]);
  }

  #[tokio::test]
  async fn test_fetch_collection_without_cache_propagates_error() {
    let cache = CacheLayer::new(MemoryStorage::new());
    cache
      .register::<Item, _, _>(key(), || async { Err(eyre!("boom")) })
      .unwrap();
    assert!(cache.fetch_collection::<Item>(&key()).await.is_err());
  }

  #[tokio::test]
  async fn test_staleness_follows_the_clock() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let cache = CacheLayer::new(MemoryStorage::new()).with_clock(clock.clone());
    cache
      .register(key(), move || {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok(vec![Item { id: 1 }]) }
      })
      .unwrap();

    cache.fetch_collection::<Item>(&key()).await.unwrap();
    let written_at = clock.now();

    clock.advance(Duration::minutes(4));
    let cached = cache.fetch_collection::<Item>(&key()).await.unwrap();
    assert_eq!(cached.source, CacheSource::CacheFresh);
    assert_eq!(cached.cached_at, Some(written_at));

    clock.advance(Duration::minutes(2));
    let refetched = cache.fetch_collection::<Item>(&key()).await.unwrap();
    assert_eq!(refetched.source, CacheSource::Network);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }
}
