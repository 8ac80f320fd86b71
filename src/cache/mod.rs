//! Client-side caching layer.
//!
//! This module provides a tenant-aware cache-aside mechanism that:
//! - Stores serialized values with per-entry TTL in a pluggable backend
//! - Degrades to an in-memory map when the primary backend is unreachable
//! - Builds deterministic keys from resource type, tenant and query params
//! - Evicts by glob pattern and tells consumer-level caches about it

mod key;
mod layer;
mod pattern;
mod storage;
mod store;
mod traits;
mod ttl;

pub use key::{build_key, CacheKey, CacheKeyBuilder, PUBLIC_SCOPE, TENANT_PREFIX};
pub use layer::{with_retry, CacheLayer, ErrorHook, ResolveOptions, RetryPolicy};
pub use pattern::{KeyPattern, PatternInvalidator};
pub use storage::{MemoryBackend, SqliteBackend};
pub use store::{CacheStats, CacheStore};
pub use traits::{CacheBackend, CacheEntry, CacheEvent, CacheResult, CacheSource, Cacheable};
pub use ttl::{CacheTtl, TtlTable};
