//! Cache layer that orchestrates caching logic with network fetching.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use super::key::CacheKey;
use super::store::CacheStore;
use super::traits::{CacheResult, Cacheable};
use crate::error::ServiceError;
use crate::query::Query;

/// Hook invoked with every fetch failure before it is propagated.
pub type ErrorHook = Arc<dyn Fn(&ServiceError) + Send + Sync>;

/// Per-call options for [`CacheLayer::resolve`].
#[derive(Clone)]
pub struct ResolveOptions {
  /// How long a fetched value stays in the store
  pub ttl: Duration,
  /// When false the call does nothing; used to gate on missing prerequisites
  pub enabled: bool,
  /// How long a consumer-level copy is considered fresh
  pub stale_time: Duration,
  pub on_error: Option<ErrorHook>,
}

impl Default for ResolveOptions {
  fn default() -> Self {
    Self {
      ttl: Duration::from_secs(300),
      enabled: true,
      stale_time: Duration::from_secs(60),
      on_error: None,
    }
  }
}

impl ResolveOptions {
  pub fn with_ttl(ttl: Duration) -> Self {
    Self {
      ttl,
      stale_time: ttl,
      ..Self::default()
    }
  }

  pub fn enabled(mut self, enabled: bool) -> Self {
    self.enabled = enabled;
    self
  }

  pub fn stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  pub fn on_error<F>(mut self, hook: F) -> Self
  where
    F: Fn(&ServiceError) + Send + Sync + 'static,
  {
    self.on_error = Some(Arc::new(hook));
    self
  }
}

impl fmt::Debug for ResolveOptions {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ResolveOptions")
      .field("ttl", &self.ttl)
      .field("enabled", &self.enabled)
      .field("stale_time", &self.stale_time)
      .field("on_error", &self.on_error.is_some())
      .finish()
  }
}

/// Bounded retry with a fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Total attempts, including the first
  pub attempts: u32,
  pub delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      attempts: 2,
      delay: Duration::from_secs(1),
    }
  }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are used up.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, ServiceError>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, ServiceError>>,
{
  let attempts = policy.attempts.max(1);
  let mut attempt = 1;
  loop {
    match op().await {
      Ok(value) => return Ok(value),
      Err(e) if e.is_retryable() && attempt < attempts => {
        debug!(attempt, error = %e, "Fetch failed, retrying");
        attempt += 1;
        tokio::time::sleep(policy.delay).await;
      }
      Err(e) => return Err(e),
    }
  }
}

/// Per-key locks used to collapse concurrent misses into one fetch.
#[derive(Default)]
struct InFlight {
  locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl InFlight {
  fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
    let mut locks = match self.locks.lock() {
      Ok(locks) => locks,
      Err(poisoned) => poisoned.into_inner(),
    };
    locks
      .entry(key.to_string())
      .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
      .clone()
  }

  fn release(&self, key: &str, lock: Arc<tokio::sync::Mutex<()>>) {
    let mut locks = match self.locks.lock() {
      Ok(locks) => locks,
      Err(poisoned) => poisoned.into_inner(),
    };
    drop(lock);
    // Only the map still holds it: nobody is waiting
    if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
      locks.remove(key);
    }
  }
}

/// Cache-aside coordinator for one value type.
///
/// Reads check the shared store first and only call the fetcher on a miss or
/// an expired entry; successful fetches are written back with the caller's
/// TTL. Concurrent misses for the same key are serialized so a burst of
/// reads results in a single fetch.
pub struct CacheLayer<T> {
  store: Arc<CacheStore>,
  in_flight: Arc<InFlight>,
  _marker: PhantomData<fn() -> T>,
}

impl<T: Cacheable> CacheLayer<T> {
  pub fn new(store: Arc<CacheStore>) -> Self {
    Self {
      store,
      in_flight: Arc::new(InFlight::default()),
      _marker: PhantomData,
    }
  }

  pub fn store(&self) -> &Arc<CacheStore> {
    &self.store
  }

  /// Read through the cache.
  ///
  /// Returns `Ok(None)` only when `options.enabled` is false, in which case
  /// neither the store nor the fetcher is touched. Fetch failures invoke
  /// `options.on_error` and are then returned unchanged.
  pub async fn resolve<F, Fut>(
    &self,
    key: &CacheKey,
    fetcher: F,
    options: &ResolveOptions,
  ) -> Result<Option<CacheResult<T>>, ServiceError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
  {
    if !options.enabled {
      return Ok(None);
    }

    let key_str = key.as_str();
    if let Some(cached) = self.store.get::<T>(key_str).await {
      return Ok(Some(CacheResult::from_cache(cached)));
    }

    let lock = self.in_flight.lock_for(key_str);
    let result = {
      let _guard = lock.lock().await;

      // Another caller may have filled the slot while we waited
      if let Some(cached) = self.store.get::<T>(key_str).await {
        Ok(CacheResult::from_cache(cached))
      } else {
        let epoch = self.store.epoch();
        match fetcher().await {
          Ok(data) => {
            if self.store.epoch() == epoch {
              self.store.set(key_str, &data, options.ttl).await;
            } else {
              debug!(key = key_str, "Invalidated during fetch, result not cached");
            }
            Ok(CacheResult::from_network(data))
          }
          Err(e) => {
            if let Some(hook) = &options.on_error {
              hook(&e);
            }
            Err(e)
          }
        }
      }
    };
    self.in_flight.release(key_str, lock);

    result.map(Some)
  }

  /// Like [`resolve`](Self::resolve), but an infrastructure failure yields
  /// the synthetic `fallback` value instead of an error. The fallback is
  /// never written to the store, so the next read tries the backend again.
  pub async fn resolve_or_fallback<F, Fut, Fb>(
    &self,
    key: &CacheKey,
    fetcher: F,
    options: &ResolveOptions,
    fallback: Fb,
  ) -> Result<Option<CacheResult<T>>, ServiceError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
    Fb: FnOnce() -> T,
  {
    match self.resolve(key, fetcher, options).await {
      Err(e) if e.is_infrastructure() => {
        warn!(key = %key, error = %e, "Backend unreachable, serving fallback");
        Ok(Some(CacheResult::fallback(fallback())))
      }
      other => other,
    }
  }

  /// Evict the key and signal subscribers that the value is gone.
  pub async fn invalidate(&self, key: &CacheKey) {
    self.store.invalidate(key.as_str()).await;
  }

  /// Optimistically write a known value and notify subscribers.
  pub async fn update(&self, key: &CacheKey, value: &T, ttl: Duration) {
    self.store.update(key.as_str(), value, ttl).await;
  }

  /// Create a consumer-level query handle bound to this layer.
  pub fn query<F, Fut>(&self, key: CacheKey, fetcher: F, options: ResolveOptions) -> Query<T>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ServiceError>> + Send + 'static,
  {
    Query::new(self.clone(), key, fetcher, options)
  }
}

impl<T> Clone for CacheLayer<T> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      in_flight: Arc::clone(&self.in_flight),
      _marker: PhantomData,
    }
  }
}
