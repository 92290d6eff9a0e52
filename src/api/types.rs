use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Collections exposed by the Client Hub backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum Collection {
  Clients,
  Tasks,
  TeamMembers,
  Statistics,
  KnowledgeArticles,
}

impl Collection {
  pub const ALL: [Collection; 5] = [
    Collection::Clients,
    Collection::Tasks,
    Collection::TeamMembers,
    Collection::Statistics,
    Collection::KnowledgeArticles,
  ];

  /// REST path segment, also used as the cache key
  pub fn path(&self) -> &'static str {
    match self {
      Collection::Clients => "clients",
      Collection::Tasks => "tasks",
      Collection::TeamMembers => "team-members",
      Collection::Statistics => "statistics",
      Collection::KnowledgeArticles => "knowledge-articles",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
  pub id: i64,
  pub name: String,
  pub email: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub phone: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub company: Option<String>,
  #[serde(default = "default_client_status")]
  pub status: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub created_at: Option<DateTime<Utc>>,
}

fn default_client_status() -> String {
  "active".to_string()
}

/// Payload for creating a client; the backend assigns the id
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewClient {
  pub name: String,
  pub email: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub phone: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub company: Option<String>,
}

impl NewClient {
  /// Placeholder record shown until the backend answers.
  pub fn into_placeholder(self, temp_id: i64) -> Client {
    Client {
      id: temp_id,
      name: self.name,
      email: self.email,
      phone: self.phone,
      company: self.company,
      status: default_client_status(),
      created_at: None,
    }
  }
}

/// Task state as sent by the backend. Values this client does not know are
/// kept verbatim so they survive a round trip.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskStatus {
  #[default]
  Pending,
  InProgress,
  Completed,
  Other(String),
}

impl TaskStatus {
  pub fn as_str(&self) -> &str {
    match self {
      TaskStatus::Pending => "pending",
      TaskStatus::InProgress => "in_progress",
      TaskStatus::Completed => "completed",
      TaskStatus::Other(status) => status,
    }
  }
}

impl From<String> for TaskStatus {
  fn from(status: String) -> Self {
    match status.as_str() {
      "pending" => TaskStatus::Pending,
      "in_progress" => TaskStatus::InProgress,
      "completed" => TaskStatus::Completed,
      _ => TaskStatus::Other(status),
    }
  }
}

impl From<TaskStatus> for String {
  fn from(status: TaskStatus) -> Self {
    match status {
      TaskStatus::Other(status) => status,
      known => known.as_str().to_string(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
  pub id: i64,
  pub title: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub client_id: Option<i64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub assigned_to: Option<i64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub due_date: Option<DateTime<Utc>>,
  #[serde(default)]
  pub status: TaskStatus,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub priority: Option<String>,
}

impl Task {
  /// Due before `now` and not completed
  pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
    self.status != TaskStatus::Completed && self.due_date.is_some_and(|due| due < now)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamMember {
  pub id: i64,
  pub name: String,
  pub email: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub role: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeArticle {
  pub id: i64,
  pub title: String,
  #[serde(default)]
  pub content: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub category: Option<String>,
}

/// Dashboard counters. The backend returns a single object, cached as a
/// one-element collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
  #[serde(default = "statistics_id")]
  pub id: String,
  #[serde(default)]
  pub total_clients: u64,
  #[serde(default)]
  pub active_clients: u64,
  #[serde(default)]
  pub total_tasks: u64,
  #[serde(default)]
  pub completed_tasks: u64,
  #[serde(default)]
  pub overdue_tasks: u64,
}

fn statistics_id() -> String {
  "summary".to_string()
}
