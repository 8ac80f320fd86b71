//! Named TTL presets for the resource families cached by the application.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTtl {
  Dashboard,
  ProductsList,
  Reports,
  Financial,
  Catalog,
  UserProfile,
  CompanyData,
}

impl CacheTtl {
  pub const ALL: [CacheTtl; 7] = [
    CacheTtl::Dashboard,
    CacheTtl::ProductsList,
    CacheTtl::Reports,
    CacheTtl::Financial,
    CacheTtl::Catalog,
    CacheTtl::UserProfile,
    CacheTtl::CompanyData,
  ];

  pub const fn as_millis(self) -> u64 {
    match self {
      CacheTtl::Dashboard => 300_000,
      CacheTtl::ProductsList => 300_000,
      CacheTtl::Reports => 600_000,
      CacheTtl::Financial => 300_000,
      CacheTtl::Catalog => 3_600_000,
      CacheTtl::UserProfile => 600_000,
      CacheTtl::CompanyData => 300_000,
    }
  }

  pub const fn duration(self) -> Duration {
    Duration::from_millis(self.as_millis())
  }

  /// Resource type name used as the first key segment.
  pub const fn resource(self) -> &'static str {
    match self {
      CacheTtl::Dashboard => "dashboard",
      CacheTtl::ProductsList => "products_list",
      CacheTtl::Reports => "reports",
      CacheTtl::Financial => "financial",
      CacheTtl::Catalog => "catalog",
      CacheTtl::UserProfile => "user_profile",
      CacheTtl::CompanyData => "company_data",
    }
  }
}

/// TTL lookup with optional per-resource overrides from configuration.
#[derive(Debug, Clone, Default)]
pub struct TtlTable {
  overrides: HashMap<CacheTtl, Duration>,
}

impl TtlTable {
  pub fn new(overrides_ms: &HashMap<CacheTtl, u64>) -> Self {
    Self {
      overrides: overrides_ms
        .iter()
        .map(|(kind, ms)| (*kind, Duration::from_millis(*ms)))
        .collect(),
    }
  }

  pub fn get(&self, kind: CacheTtl) -> Duration {
    self
      .overrides
      .get(&kind)
      .copied()
      .unwrap_or_else(|| kind.duration())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_presets() {
    assert_eq!(CacheTtl::Dashboard.as_millis(), 300_000);
    assert_eq!(CacheTtl::Reports.as_millis(), 600_000);
    assert_eq!(CacheTtl::Catalog.duration(), Duration::from_secs(3600));
    assert_eq!(CacheTtl::CompanyData.resource(), "company_data");
  }

  #[test]
  fn test_overrides() {
    let mut overrides = HashMap::new();
    overrides.insert(CacheTtl::Reports, 1_000);
    let table = TtlTable::new(&overrides);

    assert_eq!(table.get(CacheTtl::Reports), Duration::from_secs(1));
    assert_eq!(table.get(CacheTtl::Financial), Duration::from_secs(300));
  }
}
