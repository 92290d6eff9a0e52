//! User-facing notifications.
//!
//! A single [`NotificationService`] owns the subscriber registry. It is
//! created at startup, handed out by `Arc`, and torn down with
//! [`NotificationService::shutdown`]. Publishing is fire-and-forget: nothing
//! the subscribers do flows back into the publisher.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};

/// Severity of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
  Info,
  Success,
  Warning,
  Error,
}

impl Severity {
  pub fn as_str(&self) -> &'static str {
    match self {
      Severity::Info => "info",
      Severity::Success => "success",
      Severity::Warning => "warning",
      Severity::Error => "error",
    }
  }
}

impl fmt::Display for Severity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Optional follow-up offered alongside a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationAction {
  pub label: String,
  /// Where the action leads, e.g. a collection path
  pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
  pub title: String,
  pub message: String,
  pub severity: Severity,
  pub action: Option<NotificationAction>,
  pub raised_at: DateTime<Utc>,
}

impl fmt::Display for Notification {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "[{}] {}: {}", self.severity, self.title, self.message)?;
    if let Some(action) = &self.action {
      write!(f, " ({} -> {})", action.label, action.target)?;
    }
    Ok(())
  }
}

struct Registry {
  subscribers: Vec<mpsc::UnboundedSender<Notification>>,
  closed: bool,
}

/// Publish/subscribe hub for notifications.
pub struct NotificationService {
  registry: Mutex<Registry>,
  clock: Arc<dyn Clock>,
}

impl Default for NotificationService {
  fn default() -> Self {
    Self::new()
  }
}

impl NotificationService {
  pub fn new() -> Self {
    Self::with_clock(Arc::new(SystemClock))
  }

  /// Stamp notifications with `clock` instead of the wall clock.
  pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
    Self {
      registry: Mutex::new(Registry {
        subscribers: Vec::new(),
        closed: false,
      }),
      clock,
    }
  }

  /// Register a new subscriber. After shutdown the returned receiver is
  /// already closed.
  pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Notification> {
    let (tx, rx) = mpsc::unbounded_channel();
    match self.registry.lock() {
      Ok(mut registry) if !registry.closed => registry.subscribers.push(tx),
      Ok(_) => debug!("subscribe after shutdown"),
      Err(e) => warn!(error = %e, "notification registry poisoned"),
    }
    rx
  }

  /// Raise a notification to every live subscriber.
  pub fn notify(
    &self,
    title: impl Into<String>,
    message: impl Into<String>,
    severity: Severity,
    action: Option<NotificationAction>,
  ) {
    let notification = Notification {
      title: title.into(),
      message: message.into(),
      severity,
      action,
      raised_at: self.clock.now(),
    };

    let mut registry = match self.registry.lock() {
      Ok(registry) => registry,
      Err(e) => {
        warn!(error = %e, "notification registry poisoned");
        return;
      }
    };

    if registry.closed {
      debug!(title = %notification.title, "dropping notification after shutdown");
      return;
    }

    debug!(
      severity = %notification.severity,
      title = %notification.title,
      subscribers = registry.subscribers.len(),
      "notify"
    );

    // Receivers that went away are pruned on the way through
    registry
      .subscribers
      .retain(|tx| tx.send(notification.clone()).is_ok());
  }

  /// Drop all subscribers and refuse further notifications.
  pub fn shutdown(&self) {
    if let Ok(mut registry) = self.registry.lock() {
      registry.closed = true;
      registry.subscribers.clear();
    }
  }

  #[cfg(test)]
  pub fn subscriber_count(&self) -> usize {
    self
      .registry
      .lock()
      .map(|registry| registry.subscribers.len())
      .unwrap_or(0)
  }
}
