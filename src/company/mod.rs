//! Company profile access that keeps working while the backend is down.
//!
//! Reads go through the cache-aside layer and degrade to a profile
//! synthesized from the session. Writes are permission-checked, then either
//! applied to the backend and reconciled into the cache, or queued offline
//! with the cache updated optimistically.

mod profile;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::{
  build_key, with_retry, CacheKey, CacheLayer, CacheResult, CacheSource, CacheStore, CacheTtl,
  ResolveOptions, RetryPolicy,
};
use crate::config::Config;
use crate::error::{ProfileError, QueueError, ServiceError};
use crate::offline::{DrainReport, OfflineQueue, OperationKind, QueuedOperation};
use crate::refresh::RefreshScheduler;
use crate::service::{apply_queued, DataService};

pub use profile::{CompanyProfile, ProfileChanges, Role, Session, DEFAULT_CURRENCY};

pub const COMPANIES_TABLE: &str = "companies";

/// How long an optimistic write over a session-derived profile stays cached.
pub const PROVISIONAL_TTL: Duration = Duration::from_secs(30);

const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

/// Result of a profile write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
  /// The backend accepted the write; the cache holds its response.
  Saved(CompanyProfile),
  /// The write was queued for later; the cache holds the optimistic value.
  ///
  /// `provisional` is set when no authoritative profile was cached and the
  /// change was applied to the session-derived one. That value is cached for
  /// [`PROVISIONAL_TTL`] only.
  Queued {
    operation: QueuedOperation,
    profile: CompanyProfile,
    provisional: bool,
  },
}

impl WriteOutcome {
  pub fn profile(&self) -> &CompanyProfile {
    match self {
      WriteOutcome::Saved(profile) => profile,
      WriteOutcome::Queued { profile, .. } => profile,
    }
  }

  pub fn is_queued(&self) -> bool {
    matches!(self, WriteOutcome::Queued { .. })
  }
}

pub struct CompanyProfileService {
  service: Arc<dyn DataService>,
  layer: CacheLayer<CompanyProfile>,
  queue: Arc<OfflineQueue>,
  session: Session,
  ttl: Duration,
  provisional_ttl: Duration,
  retry: RetryPolicy,
  refresh_interval: Duration,
  refresh: RefreshScheduler,
  /// The cached profile was derived from the session, not the backend
  provisional: AtomicBool,
}

impl CompanyProfileService {
  pub fn new(
    service: Arc<dyn DataService>,
    store: Arc<CacheStore>,
    queue: Arc<OfflineQueue>,
    session: Session,
  ) -> Self {
    Self {
      service,
      layer: CacheLayer::new(store),
      queue,
      session,
      ttl: CacheTtl::CompanyData.duration(),
      provisional_ttl: PROVISIONAL_TTL,
      retry: RetryPolicy::default(),
      refresh_interval: DEFAULT_REFRESH_INTERVAL,
      refresh: RefreshScheduler::new(),
      provisional: AtomicBool::new(false),
    }
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = ttl;
    self
  }

  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  pub fn with_provisional_ttl(mut self, ttl: Duration) -> Self {
    self.provisional_ttl = ttl;
    self
  }

  pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
    self.refresh_interval = interval;
    self
  }

  /// Apply the company TTL, retry policy and refresh interval from config.
  pub fn with_config(self, config: &Config) -> Self {
    self
      .with_ttl(config.ttl_table().get(CacheTtl::CompanyData))
      .with_retry(config.retry_policy())
      .with_refresh_interval(config.refresh_interval())
  }

  pub fn session(&self) -> &Session {
    &self.session
  }

  /// Cache key of the session's company, if it has one.
  pub fn cache_key(&self) -> Option<CacheKey> {
    let company_id = self.session.company_id.as_deref()?;
    Some(build_key(CacheTtl::CompanyData.resource(), Some(company_id), &[]))
  }

  /// Load the profile.
  ///
  /// Returns `Ok(None)` when the session has no company. Infrastructure
  /// failures yield the session-derived fallback (tagged
  /// [`CacheSource::Fallback`](crate::cache::CacheSource)); a missing company
  /// is created from the session. Other failures are returned.
  pub async fn load(&self) -> Result<Option<CacheResult<CompanyProfile>>, ServiceError> {
    let (Some(key), Some(fallback)) = (self.cache_key(), self.session.fallback_profile()) else {
      return Ok(None);
    };

    let options = ResolveOptions::with_ttl(self.ttl);
    let seed = fallback.clone();
    let result = self
      .layer
      .resolve_or_fallback(&key, || self.fetch_or_create(seed), &options, move || fallback)
      .await?;

    if result.as_ref().is_some_and(|r| r.source == CacheSource::Network) {
      self.provisional.store(false, Ordering::SeqCst);
    }
    Ok(result)
  }

  /// Apply a partial update to the company.
  pub async fn update_profile(&self, changes: &ProfileChanges) -> Result<WriteOutcome, ProfileError> {
    let (Some(key), Some(fallback)) = (self.cache_key(), self.session.fallback_profile()) else {
      return Err(ProfileError::NoCompany);
    };

    let current = self.layer.store().get::<CompanyProfile>(key.as_str()).await;
    let provisional = current.is_none() || self.provisional.load(Ordering::SeqCst);
    self.authorize(current.as_ref().filter(|_| !provisional))?;

    let optimistic = changes.apply(current.as_ref().unwrap_or(&fallback));
    let payload = changes.payload(&fallback.id);

    if !self.queue.is_online() {
      return self.queue_write(&key, payload, optimistic, provisional).await;
    }

    match self
      .service
      .write(OperationKind::Update, COMPANIES_TABLE, &payload)
      .await
    {
      Ok(row) => {
        let saved = match decode(row) {
          Ok(saved) => saved,
          Err(e) => {
            // The write landed, so whatever is cached is out of date
            self.layer.invalidate(&key).await;
            return Err(e.into());
          }
        };
        self.layer.update(&key, &saved, self.ttl).await;
        self.provisional.store(false, Ordering::SeqCst);
        info!(company = %saved.id, "Company profile saved");
        Ok(WriteOutcome::Saved(saved))
      }
      Err(e) if e.is_infrastructure() => {
        warn!(company = %fallback.id, error = %e, "Backend unreachable, queueing profile update");
        self.queue_write(&key, payload, optimistic, provisional).await
      }
      Err(e) => Err(e.into()),
    }
  }

  /// Drop the cached profile so the next load goes to the backend.
  pub async fn invalidate(&self) {
    if let Some(key) = self.cache_key() {
      self.layer.invalidate(&key).await;
      self.provisional.store(false, Ordering::SeqCst);
    }
  }

  /// Replay queued writes and, if any were applied, drop the cached profile
  /// so the authoritative version is fetched next.
  pub async fn sync_pending(&self) -> Result<DrainReport, QueueError> {
    let service = Arc::clone(&self.service);
    let report = self
      .queue
      .drain(|op| {
        let service = Arc::clone(&service);
        async move { apply_queued(service.as_ref(), &op).await }
      })
      .await?;

    if !report.applied.is_empty() {
      self.invalidate().await;
    }
    Ok(report)
  }

  /// Refetch the profile every refresh interval for as long as this service
  /// lives.
  ///
  /// Calling it again replaces the previous timer.
  pub fn start_auto_refresh(self: &Arc<Self>) {
    let Some(key) = self.cache_key() else {
      return;
    };
    let service = Arc::downgrade(self);
    self.refresh.schedule(key.into_string(), self.refresh_interval, move || {
      let service = service.clone();
      async move {
        if let Some(service) = service.upgrade() {
          service.refresh().await;
        }
      }
    });
  }

  pub fn stop_auto_refresh(&self) {
    if let Some(key) = self.cache_key() {
      self.refresh.cancel(key.as_str());
    }
  }

  /// Fetch bypassing the cache and store the result.
  ///
  /// The cached value is kept when the fetch fails, while writes are still
  /// queued, and when the cache changed during the fetch.
  async fn refresh(&self) {
    let (Some(key), Some(seed)) = (self.cache_key(), self.session.fallback_profile()) else {
      return;
    };
    if !self.queue.is_empty() {
      debug!(key = %key, pending = self.queue.len(), "Writes pending, refresh skipped");
      return;
    }

    let epoch = self.layer.store().epoch();
    match self.fetch_or_create(seed).await {
      Ok(profile) if self.layer.store().epoch() == epoch => {
        self.layer.update(&key, &profile, self.ttl).await;
        self.provisional.store(false, Ordering::SeqCst);
      }
      Ok(_) => debug!(key = %key, "Cache changed during refresh, result dropped"),
      Err(e) => warn!(key = %key, error = %e, "Background refresh failed"),
    }
  }

  async fn fetch_or_create(&self, seed: CompanyProfile) -> Result<CompanyProfile, ServiceError> {
    let id = seed.id.clone();
    let fetched = with_retry(self.retry, || self.service.fetch(COMPANIES_TABLE, &id)).await;

    match fetched {
      Ok(row) => decode(row),
      Err(e) if e.is_not_found() => {
        info!(company = %id, "Company missing, creating it from the session");
        let row = serde_json::to_value(&seed)
          .map_err(|e| ServiceError::decode(COMPANIES_TABLE, e.to_string()))?;
        let created = self
          .service
          .write(OperationKind::Insert, COMPANIES_TABLE, &row)
          .await?;
        decode(created)
      }
      Err(e) => Err(e),
    }
  }

  async fn queue_write(
    &self,
    key: &CacheKey,
    payload: serde_json::Value,
    optimistic: CompanyProfile,
    provisional: bool,
  ) -> Result<WriteOutcome, ProfileError> {
    let operation = self
      .queue
      .add(OperationKind::Update, COMPANIES_TABLE, payload)?;
    let ttl = if provisional {
      warn!(company = %optimistic.id, "No cached profile, optimistic value is provisional");
      self.provisional_ttl
    } else {
      self.ttl
    };
    self.layer.update(key, &optimistic, ttl).await;
    self.provisional.store(provisional, Ordering::SeqCst);
    Ok(WriteOutcome::Queued {
      operation,
      profile: optimistic,
      provisional,
    })
  }

  /// Managers of the company by role, or its owner per the cached
  /// authoritative profile. A synthesized profile never grants ownership.
  fn authorize(&self, current: Option<&CompanyProfile>) -> Result<(), ServiceError> {
    let owns = current.is_some_and(|profile| profile.owner_id == self.session.user_id);
    if self.session.role.can_manage_company() || owns {
      Ok(())
    } else {
      warn!(user = %self.session.user_id, "Company update rejected");
      Err(ServiceError::unauthorized(format!(
        "User {} may not modify this company",
        self.session.user_id
      )))
    }
  }
}

fn decode(row: serde_json::Value) -> Result<CompanyProfile, ServiceError> {
  serde_json::from_value(row).map_err(|e| ServiceError::decode(COMPANIES_TABLE, e.to_string()))
}
