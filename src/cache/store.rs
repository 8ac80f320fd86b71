//! Process-wide cache store with transparent in-memory fallback.

use serde::{de::DeserializeOwned, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::pattern::KeyPattern;
use super::storage::MemoryBackend;
use super::traits::{CacheBackend, CacheEvent};
use crate::error::CacheError;

/// Capacity of the change-event channel. Slow subscribers that fall further
/// behind than this see a lag and must treat it as a full invalidation.
const EVENT_CAPACITY: usize = 256;

/// Snapshot for operational dashboards.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
  /// Live keys in whichever backend is currently serving
  pub keys: usize,
  pub backend: &'static str,
  pub backend_available: bool,
  pub fallback_size: usize,
}

/// Invalidations that could not be applied to the primary while it was down.
#[derive(Debug, Clone, PartialEq)]
enum PendingInvalidation {
  Key(String),
  Pattern(KeyPattern),
  Flush,
}

/// Key/value store with per-entry TTL.
///
/// Reads and writes go to the primary backend when one is configured and
/// reachable, and degrade to an in-memory map with the same TTL semantics
/// otherwise. Callers never see backend failures: `get` misses and `set`
/// lands in the fallback.
pub struct CacheStore {
  primary: Option<Arc<dyn CacheBackend>>,
  fallback: MemoryBackend,
  backend_available: AtomicBool,
  pending: Mutex<Vec<PendingInvalidation>>,
  /// Bumped on every eviction so in-flight fetches can detect that their
  /// result may be stale before writing it.
  epoch: AtomicU64,
  events: broadcast::Sender<CacheEvent>,
}

impl CacheStore {
  /// A store backed only by the in-memory map.
  pub fn in_memory() -> Self {
    Self::build(None)
  }

  /// A store with a primary backend and in-memory fallback.
  pub fn with_backend(primary: Arc<dyn CacheBackend>) -> Self {
    Self::build(Some(primary))
  }

  fn build(primary: Option<Arc<dyn CacheBackend>>) -> Self {
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    Self {
      primary,
      fallback: MemoryBackend::new(),
      backend_available: AtomicBool::new(true),
      pending: Mutex::new(Vec::new()),
      epoch: AtomicU64::new(0),
      events,
    }
  }

  /// Subscribe to change events.
  pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
    self.events.subscribe()
  }

  pub fn epoch(&self) -> u64 {
    self.epoch.load(Ordering::SeqCst)
  }

  pub fn is_backend_available(&self) -> bool {
    self.primary.is_none() || self.backend_available.load(Ordering::SeqCst)
  }

  /// Get a live value. Misses, expired entries, undecodable payloads and
  /// backend failures all read as `None`.
  pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    let raw = self.get_raw(key).await?;
    match serde_json::from_str(&raw) {
      Ok(value) => Some(value),
      Err(e) => {
        warn!(key, error = %e, "Dropping undecodable cache entry");
        self.invalidate_silently(key).await;
        None
      }
    }
  }

  /// Insert or replace a value, resetting its expiry clock.
  pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) {
    match serde_json::to_string(value) {
      Ok(raw) => self.set_raw(key, &raw, ttl).await,
      Err(e) => warn!(key, error = %e, "Failed to serialize cache value, not cached"),
    }
  }

  /// Write a value and tell subscribers about it, bypassing any fetcher.
  ///
  /// Advances the epoch like an eviction, so a fetch already in flight does
  /// not overwrite the new value with an older server copy.
  pub async fn update<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) {
    match serde_json::to_string(value) {
      Ok(raw) => {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.set_raw(key, &raw, ttl).await;
        self.publish(CacheEvent::Updated {
          key: key.to_string(),
          value: raw,
        });
      }
      Err(e) => warn!(key, error = %e, "Failed to serialize cache value, not updated"),
    }
  }

  /// Remove a single key. Idempotent.
  pub async fn invalidate(&self, key: &str) {
    self.invalidate_silently(key).await;
    self.publish(CacheEvent::Invalidated {
      key: key.to_string(),
    });
  }

  /// Remove every key matching the pattern; returns how many live entries
  /// were removed.
  pub async fn invalidate_pattern(&self, pattern: &KeyPattern) -> u64 {
    self.epoch.fetch_add(1, Ordering::SeqCst);

    let mut removed = self
      .fallback
      .remove_matching(pattern)
      .await
      .unwrap_or_default();

    if let Some(primary) = self.primary().await {
      match primary.remove_matching(pattern).await {
        Ok(n) => removed += n,
        Err(e) => {
          self.mark_unavailable(&e);
          self.defer(PendingInvalidation::Pattern(pattern.clone()));
        }
      }
    } else if self.primary.is_some() {
      self.defer(PendingInvalidation::Pattern(pattern.clone()));
    }

    debug!(pattern = %pattern, removed, "Invalidated cache pattern");
    self.publish(CacheEvent::PatternInvalidated {
      pattern: pattern.clone(),
    });
    removed
  }

  /// Clear everything.
  pub async fn flush(&self) {
    self.epoch.fetch_add(1, Ordering::SeqCst);
    let _ = self.fallback.clear().await;

    if let Some(primary) = self.primary().await {
      if let Err(e) = primary.clear().await {
        self.mark_unavailable(&e);
        self.defer(PendingInvalidation::Flush);
      }
    } else if self.primary.is_some() {
      self.defer(PendingInvalidation::Flush);
    }

    info!("Cache flushed");
    self.publish(CacheEvent::Flushed);
  }

  pub async fn stats(&self) -> CacheStats {
    let fallback_size = self.fallback.live_len();

    let (keys, backend) = match self.primary().await {
      Some(primary) => match primary.len().await {
        Ok(n) => (n + fallback_size, primary.name()),
        Err(e) => {
          self.mark_unavailable(&e);
          (fallback_size, self.fallback.name())
        }
      },
      None => (fallback_size, self.fallback.name()),
    };

    CacheStats {
      keys,
      backend,
      backend_available: self.is_backend_available(),
      fallback_size,
    }
  }

  async fn get_raw(&self, key: &str) -> Option<String> {
    if let Some(primary) = self.primary().await {
      match primary.get(key).await {
        Ok(Some(raw)) => return Some(raw),
        // Entries written during an outage live in the fallback
        Ok(None) => {}
        Err(e) => self.mark_unavailable(&e),
      }
    }
    self.fallback.get(key).await.ok().flatten()
  }

  async fn set_raw(&self, key: &str, raw: &str, ttl: Duration) {
    if let Some(primary) = self.primary().await {
      match primary.set(key, raw, ttl).await {
        Ok(()) => {
          let _ = self.fallback.remove(key).await;
          return;
        }
        Err(e) => self.mark_unavailable(&e),
      }
    }
    if self.primary.is_some() {
      // The primary may still hold an older value for this key
      self.defer(PendingInvalidation::Key(key.to_string()));
    }
    let _ = self.fallback.set(key, raw, ttl).await;
  }

  async fn invalidate_silently(&self, key: &str) {
    self.epoch.fetch_add(1, Ordering::SeqCst);
    let _ = self.fallback.remove(key).await;

    if let Some(primary) = self.primary().await {
      if let Err(e) = primary.remove(key).await {
        self.mark_unavailable(&e);
        self.defer(PendingInvalidation::Key(key.to_string()));
      }
    } else if self.primary.is_some() {
      self.defer(PendingInvalidation::Key(key.to_string()));
    }
  }

  /// The primary backend, if configured and reachable.
  ///
  /// While degraded, each call pings the primary and replays invalidations
  /// recorded during the outage before handing it out again, so a recovered
  /// primary never serves an entry that was evicted while it was down.
  async fn primary(&self) -> Option<&Arc<dyn CacheBackend>> {
    let primary = self.primary.as_ref()?;
    if self.backend_available.load(Ordering::SeqCst) {
      return Some(primary);
    }

    if primary.ping().await.is_err() {
      return None;
    }

    let pending = match self.pending.lock() {
      Ok(mut pending) => std::mem::take(&mut *pending),
      Err(_) => return None,
    };

    for (i, invalidation) in pending.iter().enumerate() {
      let result = match invalidation {
        PendingInvalidation::Key(key) => primary.remove(key).await,
        PendingInvalidation::Pattern(pattern) => primary.remove_matching(pattern).await.map(|_| ()),
        PendingInvalidation::Flush => primary.clear().await,
      };

      if let Err(e) = result {
        debug!(error = %e, "Cache backend still failing during recovery");
        if let Ok(mut queue) = self.pending.lock() {
          let remaining: Vec<_> = pending[i..].to_vec();
          queue.splice(0..0, remaining);
        }
        return None;
      }
    }

    self.backend_available.store(true, Ordering::SeqCst);
    info!(
      backend = primary.name(),
      replayed = pending.len(),
      "Cache backend recovered"
    );
    Some(primary)
  }

  fn mark_unavailable(&self, error: &CacheError) {
    if self.backend_available.swap(false, Ordering::SeqCst) {
      warn!(error = %error, "Cache backend unavailable, using in-memory fallback");
    }
  }

  fn defer(&self, invalidation: PendingInvalidation) {
    if let Ok(mut pending) = self.pending.lock() {
      if !pending.contains(&invalidation) {
        pending.push(invalidation);
      }
    }
  }

  fn publish(&self, event: CacheEvent) {
    // No subscribers is fine
    let _ = self.events.send(event);
  }
}


#[cfg(test)]
mod tests {
  use super::testing::SwitchableBackend;
  use super::*;

  const TTL: Duration = Duration::from_secs(60);

  fn switchable_store() -> (Arc<SwitchableBackend>, CacheStore) {
    let backend = Arc::new(SwitchableBackend::default());
    let store = CacheStore::with_backend(backend.clone());
    (backend, store)
  }

  #[tokio::test]
  async fn test_get_set_roundtrip() {
    let store = CacheStore::in_memory();
    store.set("k", &vec![1, 2, 3], TTL).await;
    assert_eq!(store.get::<Vec<i32>>("k").await, Some(vec![1, 2, 3]));
    assert_eq!(store.get::<Vec<i32>>("missing").await, None);
  }

  #[tokio::test]
  async fn test_invalidate_absent_key_is_noop() {
    let store = CacheStore::in_memory();
    store.invalidate("never-set").await;
    store.invalidate("never-set").await;
    assert_eq!(store.stats().await.keys, 0);
  }

  #[tokio::test]
  async fn test_invalidate_pattern_removes_every_tenant_key() {
    let store = CacheStore::in_memory();
    store.set("products_list:company:T1:[]", &1, TTL).await;
    store.set("reports:company:T1:[{\"y\":2024}]", &2, TTL).await;
    store.set("reports:company:T2:[]", &3, TTL).await;

    let removed = store.invalidate_pattern(&KeyPattern::parse("*company:T1*")).await;

    assert_eq!(removed, 2);
    assert_eq!(store.get::<i32>("products_list:company:T1:[]").await, None);
    assert_eq!(store.get::<i32>("reports:company:T1:[{\"y\":2024}]").await, None);
    assert_eq!(store.get::<i32>("reports:company:T2:[]").await, Some(3));
  }

  #[tokio::test]
  async fn test_flush_clears_everything() {
    let (backend, store) = switchable_store();
    store.set("a", &1, TTL).await;
    backend.set_down(true);
    store.set("b", &2, TTL).await;
    backend.set_down(false);

    store.flush().await;
    assert_eq!(store.get::<i32>("a").await, None);
    assert_eq!(store.get::<i32>("b").await, None);
  }

  #[tokio::test]
  async fn test_degrades_to_fallback_when_backend_down() {
    let (backend, store) = switchable_store();
    backend.set_down(true);

    store.set("k", &"v", TTL).await;
    assert_eq!(store.get::<String>("k").await.as_deref(), Some("v"));

    let stats = store.stats().await;
    assert!(!stats.backend_available);
    assert_eq!(stats.fallback_size, 1);
    assert_eq!(stats.backend, "memory");
  }

  #[tokio::test]
  async fn test_recovers_and_replays_invalidations() {
    let (backend, store) = switchable_store();
    store.set("company_data:company:T1:[]", &"old", TTL).await;
    store.set("dashboard:company:T1:[]", &"old", TTL).await;

    backend.set_down(true);
    store.invalidate("company_data:company:T1:[]").await;
    store.invalidate_pattern(&KeyPattern::tenant("T1")).await;
    assert!(!store.is_backend_available());

    backend.set_down(false);
    assert_eq!(store.get::<String>("company_data:company:T1:[]").await, None);
    assert_eq!(store.get::<String>("dashboard:company:T1:[]").await, None);
    assert!(store.is_backend_available());
    assert_eq!(backend.inner.live_len(), 0);
  }

  #[tokio::test]
  async fn test_update_during_outage_survives_recovery() {
    let (backend, store) = switchable_store();
    store.set("company_data:company:c1:[]", &"v1", TTL).await;

    backend.set_down(true);
    store.update("company_data:company:c1:[]", &"v2", TTL).await;
    store.update("company_data:company:c1:[]", &"v3", TTL).await;
    backend.set_down(false);

    assert_eq!(
      store.get::<String>("company_data:company:c1:[]").await.as_deref(),
      Some("v3")
    );
    assert!(store.is_backend_available());
    // Stale primary copy was evicted during recovery
    assert_eq!(backend.inner.get("company_data:company:c1:[]").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_backend_read_error_marks_unavailable() {
    let db = Arc::new(crate::db::Database::open_in_memory().unwrap());
    let store = CacheStore::with_backend(Arc::new(crate::cache::SqliteBackend::new(db.clone())));
    db.lock()
      .unwrap()
      .execute_batch("DROP TABLE cache_entries")
      .unwrap();

    assert_eq!(store.get::<i32>("k").await, None);
    assert!(!store.is_backend_available());
    assert!(!store.stats().await.backend_available);
  }

  #[tokio::test]
  async fn test_fallback_entries_visible_after_recovery() {
    let (backend, store) = switchable_store();
    backend.set_down(true);
    store.set("k", &1, TTL).await;
    backend.set_down(false);

    assert_eq!(store.get::<i32>("k").await, Some(1));
  }

  #[tokio::test]
  async fn test_events_published() {
    let store = CacheStore::in_memory();
    let mut events = store.subscribe();

    store.update("k", &5, TTL).await;
    store.invalidate("k").await;

    assert!(matches!(
      events.recv().await.unwrap(),
      CacheEvent::Updated { ref key, ref value } if key == "k" && value == "5"
    ));
    assert!(matches!(
      events.recv().await.unwrap(),
      CacheEvent::Invalidated { ref key } if key == "k"
    ));
  }

  #[tokio::test]
  async fn test_undecodable_entry_is_a_miss() {
    let store = CacheStore::in_memory();
    store.set("k", &"not a number", TTL).await;
    assert_eq!(store.get::<i32>("k").await, None);
    assert_eq!(store.get::<String>("k").await, None);
  }

  #[tokio::test]
  async fn test_epoch_advances_on_eviction_and_update() {
    let store = CacheStore::in_memory();
    let before = store.epoch();
    store.set("k", &1, TTL).await;
    assert_eq!(store.epoch(), before);
    store.invalidate("k").await;
    let after_invalidate = store.epoch();
    assert!(after_invalidate > before);
    store.update("k", &2, TTL).await;
    assert!(store.epoch() > after_invalidate);
  }
}
