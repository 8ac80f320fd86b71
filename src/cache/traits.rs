//! Core traits and types for the caching system.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

use super::pattern::KeyPattern;
use crate::error::CacheError;

/// Values that can be stored in the cache.
///
/// The store keeps values as serialized JSON, so anything that round-trips
/// through serde and can be shared across tasks qualifies.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Cacheable for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A stored value together with the data that decides its expiry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub key: String,
  /// Serialized JSON payload
  pub value: String,
  pub stored_at: DateTime<Utc>,
  pub ttl: Duration,
}

impl CacheEntry {
  pub fn new(key: impl Into<String>, value: impl Into<String>, ttl: Duration) -> Self {
    Self {
      key: key.into(),
      value: value.into(),
      stored_at: Utc::now(),
      ttl,
    }
  }

  /// An entry is stale once `now - stored_at > ttl`.
  pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
    let age = now - self.stored_at;
    match chrono::Duration::from_std(self.ttl) {
      Ok(ttl) => age > ttl,
      // TTL too large to represent: never expires
      Err(_) => false,
    }
  }

  pub fn is_expired(&self) -> bool {
    self.is_expired_at(Utc::now())
  }
}

/// Storage backend for cache entries.
///
/// Implementations must honour per-entry TTL: `get` never returns an expired
/// value. Any error is treated by the store as "backend unavailable".
#[async_trait]
pub trait CacheBackend: Send + Sync {
  /// Short name used in logs and stats.
  fn name(&self) -> &'static str;

  /// Get a live (non-expired) value.
  async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

  /// Insert or replace a value, resetting its expiry clock.
  async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

  /// Remove a single key. Removing an absent key is not an error.
  async fn remove(&self, key: &str) -> Result<(), CacheError>;

  /// Remove every key matching the pattern, returning how many were removed.
  async fn remove_matching(&self, pattern: &KeyPattern) -> Result<u64, CacheError>;

  /// Remove everything.
  async fn clear(&self) -> Result<(), CacheError>;

  /// Number of live keys.
  async fn len(&self) -> Result<usize, CacheError>;

  /// Cheap reachability check.
  async fn ping(&self) -> Result<(), CacheError>;
}

/// Result from a cache-aside read, including where the data came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
    }
  }

  /// Create a new cache result for synthetic fallback data.
  pub fn fallback(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Fallback,
    }
  }

  pub fn is_fallback(&self) -> bool {
    self.source == CacheSource::Fallback
  }
}

/// Indicates where returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from the fetcher
  Network,
  /// Live entry from the store
  Cache,
  /// Backend unreachable, serving synthetic data
  Fallback,
}

/// Change notifications published by the store.
///
/// Consumer-level caches subscribe to these so they never disagree with the
/// store about whether a value is still valid.
#[derive(Debug, Clone)]
pub enum CacheEvent {
  /// A single key was removed
  Invalidated { key: String },
  /// Every key matching the pattern was removed
  PatternInvalidated { pattern: KeyPattern },
  /// A key was written directly, bypassing the fetcher
  Updated { key: String, value: String },
  /// The whole store was cleared
  Flushed,
}

impl CacheEvent {
  /// Whether this event removes the given key.
  pub fn evicts(&self, key: &str) -> bool {
    match self {
      Self::Invalidated { key: k } => k == key,
      Self::PatternInvalidated { pattern } => pattern.matches(key),
      Self::Flushed => true,
      Self::Updated { .. } => false,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_entry_expiry_is_strict() {
    let entry = CacheEntry::new("k", "1", Duration::from_millis(1000));
    let stored = entry.stored_at;

    assert!(!entry.is_expired_at(stored + chrono::Duration::milliseconds(1000)));
    assert!(entry.is_expired_at(stored + chrono::Duration::milliseconds(1001)));
  }

  #[test]
  fn test_event_evicts() {
    let pattern = KeyPattern::parse("*company:T1*");
    let event = CacheEvent::PatternInvalidated { pattern };
    assert!(event.evicts("products_list:company:T1:[]"));
    assert!(!event.evicts("products_list:company:T2:[]"));
    assert!(CacheEvent::Flushed.evicts("anything"));
    assert!(!CacheEvent::Updated {
      key: "k".into(),
      value: "1".into()
    }
    .evicts("k"));
  }
}
