//! Bounded retry with fixed or exponential backoff.

use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Total attempts including the first one. Zero behaves like one.
  pub max_attempts: u32,
  pub base_delay: Duration,
  /// Double the delay after every failure instead of waiting `base_delay`
  pub exponential: bool,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay: Duration::from_millis(1000),
      exponential: true,
    }
  }
}

impl RetryPolicy {
  /// Wait before retrying after the given (1-based) failed attempt.
  pub fn delay_for(&self, attempt: u32) -> Duration {
    if !self.exponential {
      return self.base_delay;
    }
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    self.base_delay.saturating_mul(factor)
  }
}

/// Runs operations under a [`RetryPolicy`] and exposes progress.
///
/// `attempts()` reports the attempt number of the latest run, and
/// `is_retrying()` is set from the first failure until that run settles.
#[derive(Debug, Default)]
pub struct Retrier {
  policy: RetryPolicy,
  attempts: AtomicU32,
  retrying: AtomicBool,
}

impl Retrier {
  pub fn new(policy: RetryPolicy) -> Self {
    Self {
      policy,
      attempts: AtomicU32::new(0),
      retrying: AtomicBool::new(false),
    }
  }

  pub fn policy(&self) -> &RetryPolicy {
    &self.policy
  }

  pub fn attempts(&self) -> u32 {
    self.attempts.load(Ordering::SeqCst)
  }

  pub fn is_retrying(&self) -> bool {
    self.retrying.load(Ordering::SeqCst)
  }

  pub fn reset(&self) {
    self.attempts.store(0, Ordering::SeqCst);
    self.retrying.store(false, Ordering::SeqCst);
  }

  /// Run `operation` until it succeeds, the attempts run out, or it fails
  /// with an error `should_retry` rejects. `on_retry(attempt, &error)` is
  /// called after each failed attempt that will be retried, before the wait.
  pub async fn run_with<T, E, F, Fut, P, C>(
    &self,
    mut operation: F,
    should_retry: P,
    mut on_retry: C,
  ) -> Result<T, E>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    P: Fn(&E) -> bool,
    C: FnMut(u32, &E),
  {
    let max_attempts = self.policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
      self.attempts.store(attempt, Ordering::SeqCst);

      match operation().await {
        Ok(value) => {
          if attempt > 1 {
            debug!(attempt, "operation succeeded after retry");
          }
          self.retrying.store(false, Ordering::SeqCst);
          return Ok(value);
        }
        Err(e) if attempt < max_attempts && should_retry(&e) => {
          let delay = self.policy.delay_for(attempt);
          warn!(
            attempt,
            max_attempts,
            error = %e,
            "attempt failed, retrying in {:?}",
            delay
          );
          self.retrying.store(true, Ordering::SeqCst);
          on_retry(attempt, &e);
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
        Err(e) => {
          warn!(attempts = attempt, error = %e, "giving up");
          self.retrying.store(false, Ordering::SeqCst);
          return Err(e);
        }
      }
    }
  }
}
