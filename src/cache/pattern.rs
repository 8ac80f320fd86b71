//! Glob-style key patterns and bulk invalidation.
//!
//! Patterns support `*` wildcards anywhere in the pattern; every other
//! character matches literally. Tenant and resource patterns are derived from
//! the same escaping rules the key builder uses, so a tenant pattern covers
//! exactly the segment `:company:<tenant>:` of every key built for that tenant.

use std::fmt;
use std::sync::Arc;

use super::key::{escape_segment, TENANT_PREFIX};
use super::store::CacheStore;

/// A glob pattern over cache keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyPattern {
  glob: String,
}

impl KeyPattern {
  /// Parse a raw glob such as `*company:T1*` or `products_list:*`.
  pub fn parse(glob: impl Into<String>) -> Self {
    Self { glob: glob.into() }
  }

  /// Matches every key of every resource type owned by a tenant.
  pub fn tenant(tenant_id: &str) -> Self {
    Self::parse(format!(
      "*:{}:{}:*",
      TENANT_PREFIX,
      escape_segment(tenant_id)
    ))
  }

  /// Matches every key of one resource type for a single tenant.
  pub fn tenant_resource(resource: &str, tenant_id: &str) -> Self {
    Self::parse(format!(
      "{}:{}:{}:*",
      escape_segment(resource),
      TENANT_PREFIX,
      escape_segment(tenant_id)
    ))
  }

  pub fn as_str(&self) -> &str {
    &self.glob
  }

  /// Whether `key` matches this pattern.
  pub fn matches(&self, key: &str) -> bool {
    glob_match(&self.glob, key)
  }
}

impl fmt::Display for KeyPattern {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.glob)
  }
}

impl From<&str> for KeyPattern {
  fn from(glob: &str) -> Self {
    Self::parse(glob)
  }
}

fn glob_match(pattern: &str, text: &str) -> bool {
  let parts: Vec<&str> = pattern.split('*').collect();

  // No wildcard: exact match
  if parts.len() == 1 {
    return pattern == text;
  }

  let first = parts[0];
  let last = parts[parts.len() - 1];
  if !text.starts_with(first) {
    return false;
  }

  let mut rest = &text[first.len()..];
  for middle in &parts[1..parts.len() - 1] {
    match rest.find(middle) {
      Some(idx) => rest = &rest[idx + middle.len()..],
      None => return false,
    }
  }

  rest.ends_with(last)
}

/// Bulk eviction by pattern, for mutations whose blast radius is not known
/// precisely.
///
/// Eviction goes through the store, which also notifies every subscribed
/// consumer-level cache so both layers drop the same keys.
#[derive(Clone)]
pub struct PatternInvalidator {
  store: Arc<CacheStore>,
}

impl PatternInvalidator {
  pub fn new(store: Arc<CacheStore>) -> Self {
    Self { store }
  }

  /// Evict every entry matching the pattern.
  pub async fn invalidate_pattern(&self, pattern: impl Into<KeyPattern>) -> u64 {
    self.store.invalidate_pattern(&pattern.into()).await
  }

  /// Evict every resource type cached for a tenant.
  pub async fn invalidate_company_cache(&self, tenant_id: &str) -> u64 {
    self.invalidate_pattern(KeyPattern::tenant(tenant_id)).await
  }

  /// Evict one resource type for a tenant, e.g. the product lists after a
  /// product edit.
  pub async fn invalidate_company_resource(&self, resource: &str, tenant_id: &str) -> u64 {
    self
      .invalidate_pattern(KeyPattern::tenant_resource(resource, tenant_id))
      .await
  }
}
