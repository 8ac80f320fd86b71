//! Consumer-level query handle over the cache layer.
//!
//! Inspired by TanStack Query, a `Query<T>` owns the state a view renders
//! from (`data`, loading, error) and exposes `refetch`, `invalidate_cache`
//! and `update_cache`. Every query subscribes to the store's change events,
//! so a key evicted anywhere (directly, by pattern, or by a flush) is dropped
//! here too and fetched again.
//!
//! # Example
//!
//! ```ignore
//! let key = build_key("products_list", Some(&company_id), &[json!({"search": "x"})]);
//! let service = service.clone();
//! let mut query = layer.query(key, move || {
//!     let service = service.clone();
//!     async move { service.list_products().await }
//! }, ResolveOptions::with_ttl(CacheTtl::ProductsList.duration()));
//!
//! query.fetch();
//!
//! // In event loop tick
//! if query.poll() {
//!     // State changed, trigger re-render
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use crate::cache::{CacheEvent, CacheKey, CacheLayer, CacheResult, CacheSource, Cacheable, ResolveOptions};
use crate::error::ServiceError;

/// The state of a query
#[derive(Debug, Clone)]
pub enum QueryState<T> {
  /// Query has not been started, or its data was invalidated
  Idle,
  /// Query is currently fetching data
  Loading,
  /// Query completed successfully
  Success(T),
  /// Query failed with an error
  Error(ServiceError),
}

impl<T> QueryState<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn is_success(&self) -> bool {
    matches!(self, QueryState::Success(_))
  }

  pub fn is_error(&self) -> bool {
    matches!(self, QueryState::Error(_))
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      QueryState::Success(data) => Some(data),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&ServiceError> {
    match self {
      QueryState::Error(e) => Some(e),
      _ => None,
    }
  }
}

/// A boxed future that returns a fetch result
type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T, ServiceError>> + Send>>;

/// A factory function that creates futures for fetching data
type FetcherFn<T> = Arc<dyn Fn() -> BoxFuture<T> + Send + Sync>;

type FetchResult<T> = Result<Option<CacheResult<T>>, ServiceError>;

/// Async query for one cache key.
pub struct Query<T> {
  layer: CacheLayer<T>,
  key: CacheKey,
  options: ResolveOptions,
  state: QueryState<T>,
  source: Option<CacheSource>,
  fetcher: FetcherFn<T>,
  receiver: Option<mpsc::UnboundedReceiver<FetchResult<T>>>,
  events: broadcast::Receiver<CacheEvent>,
  fetched_at: Option<Instant>,
}

impl<T: Cacheable> Query<T> {
  pub(crate) fn new<F, Fut>(
    layer: CacheLayer<T>,
    key: CacheKey,
    fetcher: F,
    options: ResolveOptions,
  ) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ServiceError>> + Send + 'static,
  {
    let events = layer.store().subscribe();
    Self {
      layer,
      key,
      options,
      state: QueryState::Idle,
      source: None,
      fetcher: Arc::new(move || Box::pin(fetcher())),
      receiver: None,
      events,
      fetched_at: None,
    }
  }

  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  /// Get the current state of the query.
  pub fn state(&self) -> &QueryState<T> {
    &self.state
  }

  /// Get the data if the query succeeded.
  pub fn data(&self) -> Option<&T> {
    self.state.data()
  }

  /// Where the current data came from.
  pub fn source(&self) -> Option<CacheSource> {
    self.source
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  pub fn is_success(&self) -> bool {
    self.state.is_success()
  }

  pub fn is_error(&self) -> bool {
    self.state.is_error()
  }

  pub fn error(&self) -> Option<&ServiceError> {
    self.state.error()
  }

  /// Check if the data is older than the configured stale time.
  pub fn is_stale(&self) -> bool {
    match &self.state {
      QueryState::Success(_) => self
        .fetched_at
        .map(|t| t.elapsed() > self.options.stale_time)
        .unwrap_or(true),
      _ => false,
    }
  }

  /// Enable or disable the query. Disabling drops any pending fetch.
  pub fn set_enabled(&mut self, enabled: bool) {
    self.options.enabled = enabled;
    if !enabled {
      self.receiver = None;
      if self.state.is_loading() {
        self.state = QueryState::Idle;
      }
    }
  }

  /// Start fetching data if enabled and not already loading.
  pub fn fetch(&mut self) {
    if !self.options.enabled || self.state.is_loading() {
      return;
    }
    self.start_fetch();
  }

  /// Force a refetch, even if already loading or data exists.
  pub fn refetch(&mut self) {
    if !self.options.enabled {
      return;
    }
    // Cancel any pending fetch by dropping the receiver
    self.receiver = None;
    self.start_fetch();
  }

  /// Evict this key from the store (and every other subscriber), then
  /// refetch.
  pub async fn invalidate_cache(&mut self) {
    self.layer.invalidate(&self.key).await;
    self.poll();
  }

  /// Write a known value through to the store without a round trip.
  pub async fn update_cache(&mut self, value: T) {
    self.layer.update(&self.key, &value, self.options.ttl).await;
    self.poll();
  }

  /// Apply pending cache events and fetch results.
  ///
  /// Returns `true` if the state changed. Call this in your event loop tick
  /// handler.
  pub fn poll(&mut self) -> bool {
    let mut changed = self.drain_events();

    let receiver = match &mut self.receiver {
      Some(rx) => rx,
      None => return changed,
    };

    match receiver.try_recv() {
      Ok(Ok(Some(result))) => {
        self.state = QueryState::Success(result.data);
        self.source = Some(result.source);
        self.fetched_at = Some(Instant::now());
        self.receiver = None;
        changed = true;
      }
      Ok(Ok(None)) => {
        self.state = QueryState::Idle;
        self.receiver = None;
        changed = true;
      }
      Ok(Err(error)) => {
        self.state = QueryState::Error(error);
        self.receiver = None;
        changed = true;
      }
      Err(mpsc::error::TryRecvError::Empty) => {}
      Err(mpsc::error::TryRecvError::Disconnected) => {
        // Sender dropped without sending - treat as error
        self.state = QueryState::Error(ServiceError::other("Query was cancelled"));
        self.receiver = None;
        changed = true;
      }
    }

    changed
  }

  fn drain_events(&mut self) -> bool {
    let mut changed = false;
    loop {
      match self.events.try_recv() {
        Ok(CacheEvent::Updated { key, value }) if key == self.key.as_str() => {
          match serde_json::from_str::<T>(&value) {
            Ok(data) => {
              self.receiver = None;
              self.state = QueryState::Success(data);
              self.source = Some(CacheSource::Cache);
              self.fetched_at = Some(Instant::now());
              changed = true;
            }
            Err(e) => {
              warn!(key = %self.key, error = %e, "Ignoring undecodable cache update");
              changed |= self.evict();
            }
          }
        }
        Ok(event) => {
          if event.evicts(self.key.as_str()) {
            changed |= self.evict();
          }
        }
        Err(broadcast::error::TryRecvError::Lagged(missed)) => {
          // Missed events may have evicted us
          warn!(key = %self.key, missed, "Cache event subscriber lagged");
          changed |= self.evict();
        }
        Err(broadcast::error::TryRecvError::Empty)
        | Err(broadcast::error::TryRecvError::Closed) => break,
      }
    }
    changed
  }

  /// Drop local data and fetch again if enabled.
  fn evict(&mut self) -> bool {
    if matches!(self.state, QueryState::Idle) && self.receiver.is_none() {
      return false;
    }

    self.receiver = None;
    self.fetched_at = None;
    self.source = None;
    self.state = QueryState::Idle;
    if self.options.enabled {
      self.start_fetch();
    }
    true
  }

  /// Internal: start the fetch operation
  fn start_fetch(&mut self) {
    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    self.state = QueryState::Loading;

    let layer = self.layer.clone();
    let key = self.key.clone();
    let options = self.options.clone();
    let fetcher = self.fetcher.clone();
    tokio::spawn(async move {
      let result = layer.resolve(&key, move || (fetcher)(), &options).await;
      // Ignore send errors - receiver may have been dropped
      let _ = tx.send(result);
    });
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("key", &self.key)
      .field("state", &self.state)
      .field("fetched_at", &self.fetched_at)
      .field("options", &self.options)
      .finish_non_exhaustive()
  }
}
