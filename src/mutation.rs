//! Optimistic mutations over the cache.
//!
//! Every mutation writes its speculative result into the cache before the
//! server call is awaited. A failed server call restores the snapshot taken
//! just before the write (or a caller supplied revert of that snapshot) and
//! hands the server error back untouched.
//!
//! Mutations on the same cache key are serialized: the second one does not
//! take its snapshot until the first has committed or rolled back.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};

use crate::cache::{CacheKey, CacheLayer, CacheStorage, Record, RecordId};

/// Custom rollback for creates: receives the collection as it was before the
/// optimistic write, plus the item that was being created.
pub type RevertFn<T> = Box<dyn FnOnce(Vec<T>, &T) -> Vec<T> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
  Create,
  Update,
  Delete,
}

impl fmt::Display for MutationKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      MutationKind::Create => "create",
      MutationKind::Update => "update",
      MutationKind::Delete => "delete",
    })
  }
}

/// An optimistic write waiting on its server call.
struct PendingMutation<T> {
  key: CacheKey,
  kind: MutationKind,
  target: RecordId,
  /// Collection before the write; `None` if the key was never cached
  snapshot: Option<Vec<T>>,
}

/// Default create update: append the new item at the end.
pub fn append<T: Clone>(mut items: Vec<T>, item: &T) -> Vec<T> {
  items.push(item.clone());
  items
}

/// Applies optimistic creates, updates and deletes to a [`CacheLayer`].
pub struct OptimisticMutator<S: CacheStorage> {
  cache: CacheLayer<S>,
  locks: Arc<Mutex<HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>>>,
}

impl<S: CacheStorage> Clone for OptimisticMutator<S> {
  fn clone(&self) -> Self {
    Self {
      cache: self.cache.clone(),
      locks: Arc::clone(&self.locks),
    }
  }
}

impl<S: CacheStorage> OptimisticMutator<S> {
  pub fn new(cache: CacheLayer<S>) -> Self {
    Self {
      cache,
      locks: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  pub fn cache(&self) -> &CacheLayer<S> {
    &self.cache
  }

  fn key_lock(&self, key: &CacheKey) -> Result<Arc<tokio::sync::Mutex<()>>> {
    let mut locks = self
      .locks
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(Arc::clone(locks.entry(key.clone()).or_default()))
  }

  /// Insert `item` via `update_fn` immediately, then await `server_call`.
  ///
  /// The item's id must not already be cached under `key`. On failure the
  /// cache is set to `revert_fn(snapshot, &item)` when given, otherwise back
  /// to the exact pre-mutation state.
  pub async fn create<T, R, U, Fut>(
    &self,
    key: &CacheKey,
    item: T,
    update_fn: U,
    revert_fn: Option<RevertFn<T>>,
    server_call: Fut,
  ) -> Result<R>
  where
    T: Record,
    U: FnOnce(Vec<T>, &T) -> Vec<T>,
    Fut: Future<Output = Result<R>>,
  {
    let lock = self.key_lock(key)?;
    let _guard = lock.lock().await;

    let snapshot = self.cache.get::<T>(key)?;
    let target = item.id();
    if snapshot
      .as_deref()
      .unwrap_or_default()
      .iter()
      .any(|r| r.id() == target)
    {
      return Err(eyre!("Record {} already exists in {}", target, key));
    }

    let next = update_fn(snapshot.clone().unwrap_or_default(), &item);
    self.cache.set(key, &next)?;

    let pending = PendingMutation {
      key: key.clone(),
      kind: MutationKind::Create,
      target,
      snapshot,
    };
    debug!(key = %pending.key, id = %pending.target, "optimistic create applied");

    match server_call.await {
      Ok(value) => {
        self.committed(&pending);
        Ok(value)
      }
      Err(e) => {
        let restored = match revert_fn {
          Some(revert) => Some(revert(pending.snapshot.clone().unwrap_or_default(), &item)),
          None => pending.snapshot.clone(),
        };
        self.restore(&pending, restored, &e);
        Err(e)
      }
    }
  }

  /// Replace the cached record with `updated_item`'s id in place, then await
  /// `server_call`. The record must already be cached.
  pub async fn update<T, R, Fut>(&self, key: &CacheKey, updated_item: T, server_call: Fut) -> Result<R>
  where
    T: Record,
    Fut: Future<Output = Result<R>>,
  {
    let lock = self.key_lock(key)?;
    let _guard = lock.lock().await;

    let snapshot = self.cache.get::<T>(key)?;
    let target = updated_item.id();
    if !snapshot
      .as_deref()
      .unwrap_or_default()
      .iter()
      .any(|r| r.id() == target)
    {
      return Err(eyre!("Record {} not found in {}", target, key));
    }

    self.cache.update(key, |current: Vec<T>| {
      current
        .into_iter()
        .map(|r| if r.id() == target { updated_item.clone() } else { r })
        .collect()
    })?;

    let pending = PendingMutation {
      key: key.clone(),
      kind: MutationKind::Update,
      target,
      snapshot,
    };
    debug!(key = %pending.key, id = %pending.target, "optimistic update applied");

    self.settle(pending, server_call).await
  }

  /// Remove every cached record with `item_id`, then await `server_call`.
  pub async fn delete<T, R, Fut>(&self, key: &CacheKey, item_id: RecordId, server_call: Fut) -> Result<R>
  where
    T: Record,
    Fut: Future<Output = Result<R>>,
  {
    let lock = self.key_lock(key)?;
    let _guard = lock.lock().await;

    let snapshot = self.cache.get::<T>(key)?;
    if let Some(current) = &snapshot {
      let next: Vec<T> = current
        .iter()
        .filter(|r| r.id() != item_id)
        .cloned()
        .collect();
      self.cache.set(key, &next)?;
    }

    let pending = PendingMutation {
      key: key.clone(),
      kind: MutationKind::Delete,
      target: item_id,
      snapshot,
    };
    debug!(key = %pending.key, id = %pending.target, "optimistic delete applied");

    self.settle(pending, server_call).await
  }

  async fn settle<T, R, Fut>(&self, pending: PendingMutation<T>, server_call: Fut) -> Result<R>
  where
    T: Record,
    Fut: Future<Output = Result<R>>,
  {
    match server_call.await {
      Ok(value) => {
        self.committed(&pending);
        Ok(value)
      }
      Err(e) => {
        self.restore(&pending, pending.snapshot.clone(), &e);
        Err(e)
      }
    }
  }

  fn committed<T>(&self, pending: &PendingMutation<T>) {
    debug!(
      key = %pending.key,
      kind = %pending.kind,
      id = %pending.target,
      "optimistic mutation committed"
    );
  }

  /// Write back `restored` (or drop the key when it was never cached).
  /// Storage failures are logged; the server error stays the one reported.
  fn restore<T: Record>(
    &self,
    pending: &PendingMutation<T>,
    restored: Option<Vec<T>>,
    cause: &color_eyre::Report,
  ) {
    info!(
      key = %pending.key,
      kind = %pending.kind,
      id = %pending.target,
      error = %cause,
      "server rejected optimistic mutation, rolling back"
    );

    let result = match restored {
      Some(records) => self.cache.set(&pending.key, &records),
      None => self.cache.remove(&pending.key),
    };
    if let Err(e) = result {
      error!(key = %pending.key, error = %e, "rollback failed");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStorage;
  use serde::{Deserialize, Serialize};
  use tokio::sync::oneshot;

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Row {
    id: i64,
    name: String,
  }

  impl Record for Row {
    fn id(&self) -> RecordId {
      RecordId::Number(self.id)
    }
  }

  fn row(id: i64, name: &str) -> Row {
    Row {
      id,
      name: name.to_string(),
    }
  }

  fn key() -> CacheKey {
    CacheKey::from("clients")
  }

  fn seeded() -> OptimisticMutator<MemoryStorage> {
    let cache = CacheLayer::new(MemoryStorage::new());
    cache
      .set(&key(), &[row(1, "Acme"), row(7, "A"), row(3, "Globex")])
      .unwrap();
    OptimisticMutator::new(cache)
  }

  fn cached(m: &OptimisticMutator<MemoryStorage>) -> Vec<Row> {
    m.cache().get::<Row>(&key()).unwrap().unwrap()
  }

  #[tokio::test]
  async fn test_create_visible_before_server_resolves() {
    let m = seeded();
    let cache = m.cache().clone();

    let seen = m
      .create(&key(), row(9, "Initech"), append, None, async move {
        Ok::<_, color_eyre::Report>(cache.get::<Row>(&key())?.unwrap_or_default())
      })
      .await
      .unwrap();

    assert!(seen.contains(&row(9, "Initech")));
    assert_eq!(cached(&m).last(), Some(&row(9, "Initech")));
  }

  #[tokio::test]
  async fn test_create_failure_restores_snapshot() {
    let m = seeded();
    let before = cached(&m);

    let result: Result<()> = m
      .create(&key(), row(9, "Initech"), append, None, async {
        Err(eyre!("500 Internal Server Error"))
      })
      .await;

    assert_eq!(result.unwrap_err().to_string(), "500 Internal Server Error");
    assert_eq!(cached(&m), before);
  }

  #[tokio::test]
  async fn test_create_failure_with_custom_revert() {
    let m = seeded();
    let snapshot = cached(&m);

    // Keeps the failed item visible, marked as such
    let mark_failed: RevertFn<Row> = Box::new(|mut items: Vec<Row>, item: &Row| {
      items.push(row(item.id, &format!("{} (not saved)", item.name)));
      items
    });

    let result: Result<()> = m
      .create(
        &key(),
        row(9, "Initech"),
        |items, item| {
          let mut next = vec![item.clone()];
          next.extend(items);
          next
        },
        Some(mark_failed),
        async { Err(eyre!("rejected")) },
      )
      .await;

    assert!(result.is_err());
    let mut expected = snapshot;
    expected.push(row(9, "Initech (not saved)"));
    assert_eq!(cached(&m), expected);
  }

  #[tokio::test]
  async fn test_identity_revert_yields_the_snapshot() {
    let m = seeded();
    let snapshot = cached(&m);
    let identity: RevertFn<Row> = Box::new(|items: Vec<Row>, _: &Row| items);

    let result: Result<()> = m
      .create(
        &key(),
        row(9, "Initech"),
        append,
        Some(identity),
        async { Err(eyre!("rejected")) },
      )
      .await;

    assert!(result.is_err());
    assert_eq!(cached(&m), snapshot);
  }

  #[tokio::test]
  async fn test_create_failure_on_uncached_key_leaves_it_uncached() {
    let m = OptimisticMutator::new(CacheLayer::new(MemoryStorage::new()));

    let result: Result<()> = m
      .create(&key(), row(1, "Acme"), append, None, async {
        Err(eyre!("offline"))
      })
      .await;

    assert!(result.is_err());
    assert!(m.cache().get::<Row>(&key()).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_create_duplicate_is_rejected_without_server_call() {
    let m = seeded();
    let before = cached(&m);
    let mut called = false;

    let result = m
      .create(&key(), row(7, "dup"), append, None, async {
        called = true;
        Ok(())
      })
      .await;

    assert!(result.is_err());
    assert!(!called);
    assert_eq!(cached(&m), before);
  }

  #[tokio::test]
  async fn test_update_round_trip() {
    let m = seeded();

    m.update(&key(), row(7, "B"), async { Ok(()) })
      .await
      .unwrap();

    let rows = cached(&m);
    let matching: Vec<_> = rows.iter().filter(|r| r.id == 7).collect();
    assert_eq!(matching, vec![&row(7, "B")]);
    assert_eq!(rows.len(), 3);
    // Order is preserved
    assert_eq!(rows[1], row(7, "B"));
  }

  #[tokio::test]
  async fn test_update_failure_restores_snapshot() {
    let m = seeded();
    let before = cached(&m);

    let result: Result<()> = m
      .update(&key(), row(7, "B"), async { Err(eyre!("conflict")) })
      .await;

    assert_eq!(result.unwrap_err().to_string(), "conflict");
    assert_eq!(cached(&m), before);
  }

  #[tokio::test]
  async fn test_update_missing_record_is_rejected() {
    let m = seeded();
    let result = m.update(&key(), row(42, "ghost"), async { Ok(()) }).await;
    assert!(result.is_err());
    assert_eq!(cached(&m).len(), 3);
  }

  #[tokio::test]
  async fn test_delete_and_rollback() {
    let m = seeded();
    let before = cached(&m);

    let result: Result<()> = m
      .delete::<Row, _, _>(&key(), RecordId::from(7), async { Err(eyre!("forbidden")) })
      .await;
    assert!(result.is_err());
    assert_eq!(cached(&m), before);

    m.delete::<Row, _, _>(&key(), RecordId::from(7), async { Ok(()) })
      .await
      .unwrap();
    assert_eq!(cached(&m), vec![row(1, "Acme"), row(3, "Globex")]);
  }

  #[tokio::test]
  async fn test_mutations_on_same_key_are_serialized() {
    let m = seeded();
    let (fail_first, first_outcome) = oneshot::channel::<()>();

    let first = {
      let m = m.clone();
      tokio::spawn(async move {
        m.update(&key(), row(1, "Renamed"), async move {
          let _ = first_outcome.await;
          Err::<(), _>(eyre!("rejected"))
        })
        .await
      })
    };

    // Wait until the first mutation has applied its optimistic write
    while !cached(&m).contains(&row(1, "Renamed")) {
      tokio::task::yield_now().await;
    }

    let second = {
      let m = m.clone();
      tokio::spawn(async move { m.update(&key(), row(3, "Umbrella"), async { Ok(()) }).await })
    };

    for _ in 0..10 {
      tokio::task::yield_now().await;
    }
    assert!(!cached(&m).contains(&row(3, "Umbrella")));

    fail_first.send(()).unwrap();
    assert!(first.await.unwrap().is_err());
    second.await.unwrap().unwrap();

    assert_eq!(
      cached(&m),
      vec![row(1, "Acme"), row(7, "A"), row(3, "Umbrella")]
    );
  }
}
