//! Cache keys identifying resource collections.

use sha2::{Digest, Sha256};
use std::fmt;

/// Ordered path segments naming a cached collection, e.g. `["clients"]` or
/// `["tasks", "client", "7"]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Vec<String>);

impl CacheKey {
  pub fn new<I, S>(segments: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self(segments.into_iter().map(Into::into).collect())
  }

  /// Parse a slash separated key such as `tasks/client/7`.
  /// Empty segments are dropped.
  pub fn parse(path: &str) -> Self {
    Self::new(path.split('/').map(str::trim).filter(|s| !s.is_empty()))
  }

  pub fn segments(&self) -> &[String] {
    &self.0
  }

  /// Stable, fixed-length key for storage backends.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    for segment in &self.0 {
      hasher.update(segment.as_bytes());
      // Separator keeps ["ab", "c"] and ["a", "bc"] apart
      hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.segments().join("/"))
  }
}

impl From<&str> for CacheKey {
  fn from(path: &str) -> Self {
    Self::parse(path)
  }
}
