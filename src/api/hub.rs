//! Cached Client Hub client: reads go through the cache layer, writes go
//! through the optimistic mutator with retried server calls.

use chrono::Utc;
use color_eyre::{eyre::eyre, Report, Result};
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::warn;

use crate::cache::{CacheLayer, CacheResult, CacheStorage, Record, RecordId};
use crate::mutation::{append, OptimisticMutator};
use crate::notify::{NotificationService, Severity};
use crate::retry::{RetryPolicy, Retrier};

use super::client::{self, RestClient};
use super::types::{
  Client, Collection, KnowledgeArticle, NewClient, Statistics, Task, TaskStatus, TeamMember,
};

pub struct Hub<S: CacheStorage> {
  rest: RestClient,
  mutator: OptimisticMutator<S>,
  retrier: Retrier,
  notifier: Arc<NotificationService>,
  /// Next temporary id for a client that is not yet stored by the backend
  next_placeholder_id: AtomicI64,
}

impl<S: CacheStorage> Hub<S> {
  /// Build the hub and register a backend fetcher for every collection.
  pub fn new(
    rest: RestClient,
    cache: CacheLayer<S>,
    retry: RetryPolicy,
    notifier: Arc<NotificationService>,
  ) -> Result<Self> {
    register_list::<S, Client>(&cache, &rest, Collection::Clients)?;
    register_list::<S, Task>(&cache, &rest, Collection::Tasks)?;
    register_list::<S, TeamMember>(&cache, &rest, Collection::TeamMembers)?;
    register_list::<S, KnowledgeArticle>(&cache, &rest, Collection::KnowledgeArticles)?;

    let stats_rest = rest.clone();
    cache.register(Collection::Statistics.key(), move || {
      let rest = stats_rest.clone();
      async move { Ok::<_, Report>(vec![rest.statistics().await?]) }
    })?;

    Ok(Self {
      rest,
      mutator: OptimisticMutator::new(cache),
      retrier: Retrier::new(retry),
      notifier,
      // Negative ids never collide with backend-assigned ones; starting from
      // the clock keeps them apart from placeholders of earlier runs
      next_placeholder_id: AtomicI64::new(-Utc::now().timestamp_millis()),
    })
  }

  pub fn cache(&self) -> &CacheLayer<S> {
    self.mutator.cache()
  }

  /// Progress of the latest write's backend call.
  pub fn retrier(&self) -> &Retrier {
    &self.retrier
  }

  /// Cache-first read of any collection.
  pub async fn list<T: Record>(&self, collection: Collection) -> Result<CacheResult<Vec<T>>> {
    self.cache().fetch_collection(&collection.key()).await
  }

  pub async fn statistics(&self) -> Result<Option<Statistics>> {
    let result = self.list::<Statistics>(Collection::Statistics).await?;
    Ok(result.data.into_iter().next())
  }

  fn placeholder_id(&self) -> i64 {
    self.next_placeholder_id.fetch_sub(1, Ordering::SeqCst)
  }

  /// Show the client right away under a temporary id, then create it on the
  /// backend and refetch the collection to pick up the real record.
  ///
  /// The POST is only repeated when the connection could not be made, so a
  /// slow backend never ends up with the client twice.
  pub async fn create_client(&self, draft: NewClient) -> Result<Client> {
    let key = Collection::Clients.key();
    let placeholder = draft.clone().into_placeholder(self.placeholder_id());

    let server_call = self.send("create client", client::never_sent, |rest| {
      let draft = draft.clone();
      async move { rest.create::<_, Client>(Collection::Clients, &draft).await }
    });
    let result = self
      .mutator
      .create(&key, placeholder, append, None, server_call)
      .await;

    let created = self.settled("create client", result)?;
    self.refresh(Collection::Clients).await;
    Ok(created)
  }

  pub async fn update_client(&self, updated: Client) -> Result<Client> {
    let key = Collection::Clients.key();
    let body = updated.clone();

    let server_call = self.send("update client", client::is_transient, |rest| {
      let body = body.clone();
      async move {
        rest
          .update::<_, Client>(Collection::Clients, body.id, &body)
          .await
      }
    });
    let result = self.mutator.update(&key, updated, server_call).await;

    self.settled("update client", result)
  }

  pub async fn delete_client(&self, id: i64) -> Result<()> {
    let key = Collection::Clients.key();

    let server_call = self.send("delete client", client::is_transient, |rest| async move {
      rest.delete(Collection::Clients, id).await
    });
    let result = self
      .mutator
      .delete::<Client, _, _>(&key, RecordId::Number(id), server_call)
      .await;

    self.settled("delete client", result)
  }

  /// Mark a cached task completed.
  pub async fn complete_task(&self, id: i64) -> Result<Task> {
    let key = Collection::Tasks.key();
    let task = self
      .cache()
      .get::<Task>(&key)?
      .unwrap_or_default()
      .into_iter()
      .find(|t| t.id == id)
      .ok_or_else(|| eyre!("Task {} is not cached; run `list tasks` first", id))?;

    let updated = Task {
      status: TaskStatus::Completed,
      ..task
    };

    let body = updated.clone();
    let server_call = self.send("complete task", client::is_transient, |rest| {
      let body = body.clone();
      async move { rest.update::<_, Task>(Collection::Tasks, body.id, &body).await }
    });
    let result = self.mutator.update(&key, updated, server_call).await;

    self.settled("complete task", result)
  }

  /// Run a backend call under the retry policy, announcing every retry.
  async fn send<T, F, Fut>(
    &self,
    action: &str,
    should_retry: fn(&Report) -> bool,
    mut call: F,
  ) -> Result<T>
  where
    F: FnMut(RestClient) -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    // Leave the counters alone while another write is backing off
    if !self.retrier.is_retrying() {
      self.retrier.reset();
    }
    let max_attempts = self.retrier.policy().max_attempts.max(1);

    self
      .retrier
      .run_with(
        || call(self.rest.clone()),
        should_retry,
        |attempt, e| {
          self.notifier.notify(
            format!("Retrying {}", action),
            format!("Attempt {} of {} failed: {}", attempt, max_attempts, e),
            Severity::Info,
            None,
          )
        },
      )
      .await
  }

  /// Surface a failed mutation to the user; the error itself is passed on.
  fn settled<T>(&self, action: &str, result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
      self.report_failure(action, e);
    }
    result
  }

  fn report_failure(&self, action: &str, e: &Report) {
    self.notifier.notify(
      format!("Could not {}", action),
      e.to_string(),
      Severity::Error,
      None,
    );
  }

  /// Best-effort refetch after a committed write.
  async fn refresh(&self, collection: Collection) {
    if let Err(e) = self.cache().invalidate(&collection.key()).await {
      warn!(collection = collection.path(), error = %e, "refresh after write failed");
    }
  }
}

fn register_list<S, T>(cache: &CacheLayer<S>, rest: &RestClient, collection: Collection) -> Result<()>
where
  S: CacheStorage,
  T: Record,
{
  let rest = rest.clone();
  cache.register(collection.key(), move || {
    let rest = rest.clone();
    async move { rest.list::<T>(collection).await }
  })
}
