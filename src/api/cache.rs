//! Caching implementations for Client Hub types.

use crate::cache::{CacheKey, Record, RecordId};

use super::types::{Client, Collection, KnowledgeArticle, Statistics, Task, TeamMember};

impl Record for Client {
  fn id(&self) -> RecordId {
    RecordId::Number(self.id)
  }
}

impl Record for Task {
  fn id(&self) -> RecordId {
    RecordId::Number(self.id)
  }
}

impl Record for TeamMember {
  fn id(&self) -> RecordId {
    RecordId::Number(self.id)
  }
}

impl Record for KnowledgeArticle {
  fn id(&self) -> RecordId {
    RecordId::Number(self.id)
  }
}

impl Record for Statistics {
  fn id(&self) -> RecordId {
    RecordId::Text(self.id.clone())
  }
}

impl Collection {
  pub fn key(&self) -> CacheKey {
    CacheKey::parse(self.path())
  }
}
