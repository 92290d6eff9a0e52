//! Periodic reconciliation of the cache with the backend.
//!
//! A sync invalidates every configured collection so it is refetched, then
//! looks at the reconciled tasks and raises an alert when some are overdue.
//! Failures of individual refetches are logged and otherwise ignored; a sync
//! always ends back in the idle state with `last_sync` updated.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::api::types::{Collection, Task};
use crate::cache::{CacheKey, CacheLayer, CacheStorage};
use crate::clock::Clock;
use crate::notify::{NotificationAction, NotificationService, Severity};

/// Elapsed time after which a connected cache counts as outdated
const OUTDATED_AFTER: chrono::Duration = chrono::Duration::seconds(60);
/// Elapsed time after which a connected cache counts as stale
const STALE_AFTER: chrono::Duration = chrono::Duration::seconds(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncState {
  pub last_sync: Option<DateTime<Utc>>,
  pub is_syncing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
  Syncing,
  Disconnected,
  Stale,
  Outdated,
  Connected,
}

impl SyncStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      SyncStatus::Syncing => "syncing",
      SyncStatus::Disconnected => "disconnected",
      SyncStatus::Stale => "stale",
      SyncStatus::Outdated => "outdated",
      SyncStatus::Connected => "connected",
    }
  }
}

impl SyncState {
  /// Display status as of `now`.
  pub fn status(&self, now: DateTime<Utc>) -> SyncStatus {
    if self.is_syncing {
      return SyncStatus::Syncing;
    }
    let Some(last_sync) = self.last_sync else {
      return SyncStatus::Disconnected;
    };

    let elapsed = now - last_sync;
    if elapsed > STALE_AFTER {
      SyncStatus::Stale
    } else if elapsed > OUTDATED_AFTER {
      SyncStatus::Outdated
    } else {
      SyncStatus::Connected
    }
  }
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
  pub interval: Duration,
  pub keys: Vec<CacheKey>,
  pub notifications_enabled: bool,
  /// Collection inspected for overdue tasks after each sync
  pub tasks_key: CacheKey,
}

impl Default for SyncOptions {
  fn default() -> Self {
    Self {
      interval: Duration::from_secs(30),
      keys: Collection::ALL.iter().map(Collection::key).collect(),
      notifications_enabled: true,
      tasks_key: Collection::Tasks.key(),
    }
  }
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
  pub refreshed: usize,
  pub failed: usize,
  pub overdue: usize,
  pub finished_at: DateTime<Utc>,
}

pub struct Reconciler<S: CacheStorage> {
  cache: CacheLayer<S>,
  notifier: Arc<NotificationService>,
  clock: Arc<dyn Clock>,
  options: SyncOptions,
  state: watch::Sender<SyncState>,
}

impl<S: CacheStorage> Reconciler<S> {
  pub fn new(
    cache: CacheLayer<S>,
    notifier: Arc<NotificationService>,
    clock: Arc<dyn Clock>,
    options: SyncOptions,
  ) -> Self {
    let (state, _) = watch::channel(SyncState::default());
    Self {
      cache,
      notifier,
      clock,
      options,
      state,
    }
  }

  pub fn state(&self) -> SyncState {
    *self.state.borrow()
  }

  pub fn watch_state(&self) -> watch::Receiver<SyncState> {
    self.state.subscribe()
  }

  pub fn status(&self) -> SyncStatus {
    self.state().status(self.clock.now())
  }

  /// Run one reconciliation pass.
  pub async fn sync(&self) -> SyncReport {
    self.state.send_modify(|s| s.is_syncing = true);
    info!(keys = self.options.keys.len(), "sync started");

    let results = join_all(
      self
        .options
        .keys
        .iter()
        .map(|key| async move { (key, self.cache.invalidate(key).await) }),
    )
    .await;

    let mut failed = 0;
    for (key, result) in &results {
      if let Err(e) = result {
        failed += 1;
        warn!(%key, error = %e, "refetch failed during sync");
      }
    }

    let finished_at = self.clock.now();
    self.state.send_modify(|s| {
      s.is_syncing = false;
      s.last_sync = Some(finished_at);
    });

    let overdue = if self.options.notifications_enabled {
      self.check_overdue(finished_at)
    } else {
      0
    };

    let report = SyncReport {
      refreshed: results.len() - failed,
      failed,
      overdue,
      finished_at,
    };
    info!(
      refreshed = report.refreshed,
      failed = report.failed,
      overdue = report.overdue,
      "sync finished"
    );
    report
  }

  /// Manual sync; always confirms with a success notification.
  pub async fn force_sync(&self) -> SyncReport {
    let report = self.sync().await;
    self.notifier.notify(
      "Sync complete",
      "Data refreshed from the server",
      Severity::Success,
      None,
    );
    report
  }

  fn check_overdue(&self, now: DateTime<Utc>) -> usize {
    let tasks = match self.cache.get::<Task>(&self.options.tasks_key) {
      Ok(tasks) => tasks.unwrap_or_default(),
      Err(e) => {
        warn!(error = %e, "could not read tasks for overdue check");
        return 0;
      }
    };

    let overdue = tasks.iter().filter(|t| t.is_overdue(now)).count();
    if overdue > 0 {
      let noun = if overdue == 1 { "task" } else { "tasks" };
      self.notifier.notify(
        "Overdue tasks",
        format!("You have {} overdue {}", overdue, noun),
        Severity::Warning,
        Some(NotificationAction {
          label: "View tasks".to_string(),
          target: self.options.tasks_key.to_string(),
        }),
      );
    }
    overdue
  }
}

impl<S: CacheStorage> Reconciler<S> {
  /// Start the periodic loop. The first tick fires one interval from now.
  pub fn spawn(self: Arc<Self>) -> SyncHandle {
    let (trigger_tx, mut trigger_rx) = mpsc::unbounded_channel::<()>();
    let period = self.options.interval;

    let task = tokio::spawn(async move {
      let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

      loop {
        tokio::select! {
          _ = ticker.tick() => {
            self.sync().await;
          }
          trigger = trigger_rx.recv() => match trigger {
            Some(()) => {
              self.force_sync().await;
              ticker.reset();
            }
            None => break,
          },
        }
      }
      debug!("sync loop stopped");
    });

    SyncHandle {
      trigger: trigger_tx,
      task,
    }
  }
}

/// Owner of the periodic sync task. Dropping it cancels the task.
pub struct SyncHandle {
  trigger: mpsc::UnboundedSender<()>,
  task: JoinHandle<()>,
}

impl SyncHandle {
  /// Ask the loop for an immediate sync; restarts the interval.
  pub fn trigger(&self) {
    if self.trigger.send(()).is_err() {
      debug!("sync loop already stopped");
    }
  }

  pub fn shutdown(&self) {
    self.task.abort();
  }

  #[cfg(test)]
  pub fn is_finished(&self) -> bool {
    self.task.is_finished()
  }
}

impl Drop for SyncHandle {
  fn drop(&mut self) {
    self.task.abort();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::types::TaskStatus;
  use crate::cache::MemoryStorage;
  use crate::clock::ManualClock;
  use crate::notify::Notification;
  use chrono::TimeZone;
  use color_eyre::eyre::eyre;
  use std::sync::atomic::{AtomicU32, Ordering};

  fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
  }

  fn task(id: i64, due: DateTime<Utc>, status: TaskStatus) -> Task {
    Task {
      id,
      title: format!("task {}", id),
      description: None,
      client_id: None,
      assigned_to: None,
      due_date: Some(due),
      status,
      priority: None,
    }
  }

  struct Fixture {
    reconciler: Arc<Reconciler<MemoryStorage>>,
    clock: Arc<ManualClock>,
    notifications: mpsc::UnboundedReceiver<Notification>,
  }

  fn fixture(tasks: Vec<Task>, options: SyncOptions) -> Fixture {
    let cache = CacheLayer::new(MemoryStorage::new());
    cache
      .register(Collection::Tasks.key(), move || {
        let tasks = tasks.clone();
        async move { Ok(tasks) }
      })
      .unwrap();

    let notifier = Arc::new(NotificationService::new());
    let notifications = notifier.subscribe();
    let clock = Arc::new(ManualClock::new(start()));
    let reconciler = Arc::new(Reconciler::new(
      cache,
      notifier,
      clock.clone(),
      options,
    ));

    Fixture {
      reconciler,
      clock,
      notifications,
    }
  }

  fn tasks_only() -> SyncOptions {
    SyncOptions {
      keys: vec![Collection::Tasks.key()],
      ..SyncOptions::default()
    }
  }

  fn drain(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Vec<Notification> {
    let mut out = Vec::new();
    while let Ok(n) = rx.try_recv() {
      out.push(n);
    }
    out
  }

  #[test]
  fn test_status_derivation() {
    let now = start();
    let state = |last: Option<i64>, syncing: bool| SyncState {
      last_sync: last.map(|secs| now - chrono::Duration::seconds(secs)),
      is_syncing: syncing,
    };

    assert_eq!(state(Some(5), true).status(now), SyncStatus::Syncing);
    assert_eq!(state(None, false).status(now), SyncStatus::Disconnected);
    assert_eq!(state(Some(121), false).status(now), SyncStatus::Stale);
    assert_eq!(state(Some(120), false).status(now), SyncStatus::Outdated);
    assert_eq!(state(Some(61), false).status(now), SyncStatus::Outdated);
    assert_eq!(state(Some(60), false).status(now), SyncStatus::Connected);
  }

  #[test]
  fn test_default_options() {
    let options = SyncOptions::default();
    let keys: Vec<String> = options.keys.iter().map(ToString::to_string).collect();
    assert_eq!(
      keys,
      [
        "clients",
        "tasks",
        "team-members",
        "statistics",
        "knowledge-articles"
      ]
    );
    assert_eq!(options.interval, Duration::from_secs(30));
    assert!(options.notifications_enabled);
  }

  #[tokio::test]
  async fn test_overdue_tasks_raise_one_notification() {
    let now = start();
    let mut f = fixture(
      vec![
        task(1, now - chrono::Duration::days(1), TaskStatus::Pending),
        task(2, now + chrono::Duration::days(1), TaskStatus::Pending),
      ],
      tasks_only(),
    );

    let report = f.reconciler.sync().await;
    assert_eq!(report.overdue, 1);

    let raised = drain(&mut f.notifications);
    assert_eq!(raised.len(), 1);
    assert_eq!(raised[0].severity, Severity::Warning);
    assert_eq!(raised[0].message, "You have 1 overdue task");
  }

  #[tokio::test]
  async fn test_completed_tasks_are_not_overdue() {
    let now = start();
    let mut f = fixture(
      vec![task(1, now - chrono::Duration::days(3), TaskStatus::Completed)],
      tasks_only(),
    );

    f.reconciler.sync().await;
    assert!(drain(&mut f.notifications).is_empty());
  }

  #[tokio::test]
  async fn test_notifications_can_be_disabled() {
    let now = start();
    let mut f = fixture(
      vec![task(1, now - chrono::Duration::days(1), TaskStatus::Pending)],
      SyncOptions {
        notifications_enabled: false,
        ..tasks_only()
      },
    );

    let report = f.reconciler.sync().await;
    assert_eq!(report.overdue, 0);
    assert!(drain(&mut f.notifications).is_empty());
  }

  #[tokio::test]
  async fn test_quiet_sync_is_idempotent() {
    let mut f = fixture(Vec::new(), tasks_only());
    assert_eq!(f.reconciler.status(), SyncStatus::Disconnected);

    f.reconciler.sync().await;
    let first = f.reconciler.state().last_sync.unwrap();

    f.clock.advance(chrono::Duration::seconds(10));
    f.reconciler.sync().await;
    let second = f.reconciler.state().last_sync.unwrap();

    assert!(second >= first);
    assert!(!f.reconciler.state().is_syncing);
    assert_eq!(f.reconciler.status(), SyncStatus::Connected);
    assert!(drain(&mut f.notifications).is_empty());

    f.clock.advance(chrono::Duration::seconds(90));
    assert_eq!(f.reconciler.status(), SyncStatus::Outdated);
  }

  #[tokio::test]
  async fn test_failed_refetch_is_swallowed() {
    let f = fixture(Vec::new(), SyncOptions::default());
    f.reconciler
      .cache
      .register::<Task, _, _>(Collection::Clients.key(), || async { Err(eyre!("503")) })
      .unwrap();

    // clients fails, three keys have no fetcher at all
    let report = f.reconciler.sync().await;
    assert_eq!(report.refreshed, 1);
    assert_eq!(report.failed, 4);

    let state = f.reconciler.state();
    assert!(!state.is_syncing);
    assert_eq!(state.last_sync, Some(start()));
  }

  #[tokio::test]
  async fn test_force_sync_confirms() {
    let mut f = fixture(Vec::new(), tasks_only());
    f.reconciler.force_sync().await;

    let raised = drain(&mut f.notifications);
    assert_eq!(raised.len(), 1);
    assert_eq!(raised[0].severity, Severity::Success);
  }

  #[tokio::test]
  async fn test_is_syncing_while_refetch_in_flight() {
    let (release, gate) = tokio::sync::oneshot::channel::<()>();
    let gate = Arc::new(tokio::sync::Mutex::new(Some(gate)));

    let cache = CacheLayer::new(MemoryStorage::new());
    cache
      .register(Collection::Tasks.key(), move || {
        let gate = Arc::clone(&gate);
        async move {
          if let Some(rx) = gate.lock().await.take() {
            let _ = rx.await;
          }
          Ok(Vec::<Task>::new())
        }
      })
      .unwrap();

    let reconciler = Arc::new(Reconciler::new(
      cache,
      Arc::new(NotificationService::new()),
      Arc::new(ManualClock::new(start())),
      tasks_only(),
    ));
    let mut state = reconciler.watch_state();

    let running = tokio::spawn({
      let reconciler = Arc::clone(&reconciler);
      async move { reconciler.sync().await }
    });

    state.wait_for(|s| s.is_syncing).await.unwrap();
    assert_eq!(reconciler.status(), SyncStatus::Syncing);

    release.send(()).unwrap();
    running.await.unwrap();
    assert!(!reconciler.state().is_syncing);
  }

  #[tokio::test(start_paused = true)]
  async fn test_periodic_loop_trigger_and_shutdown() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let cache = CacheLayer::new(MemoryStorage::new());
    cache
      .register(Collection::Tasks.key(), move || {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok(Vec::<Task>::new()) }
      })
      .unwrap();

    let notifier = Arc::new(NotificationService::new());
    let mut notifications = notifier.subscribe();
    let reconciler = Arc::new(Reconciler::new(
      cache,
      notifier,
      Arc::new(ManualClock::new(start())),
      tasks_only(),
    ));

    let handle = Arc::clone(&reconciler).spawn();

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_secs(32)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    handle.trigger();
    notifications.recv().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    handle.shutdown();
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(handle.is_finished());
  }
}
