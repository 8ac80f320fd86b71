//! Deterministic, tenant-scoped cache keys.
//!
//! Keys have the shape `<resource>:<scope>:<params>` where `<scope>` is
//! `company:<tenant>` or the `public` sentinel, and `<params>` is the
//! canonical JSON array of discriminating parameters. Object fields are
//! sorted at every depth, so logically identical queries always land on the
//! same key regardless of how their filters were assembled.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// Scope segment marker for tenant-owned data.
pub const TENANT_PREFIX: &str = "company";

/// Scope segment for data that belongs to no tenant (catalogs etc).
pub const PUBLIC_SCOPE: &str = "public";

/// Canonical parameter strings longer than this are replaced by a digest.
const MAX_PARAMS_LEN: usize = 200;

/// A fully built cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
  pub fn as_str(&self) -> &str {
    &self.0
  }

  pub fn into_string(self) -> String {
    self.0
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl AsRef<str> for CacheKey {
  fn as_ref(&self) -> &str {
    &self.0
  }
}

impl From<&str> for CacheKey {
  fn from(key: &str) -> Self {
    Self(key.to_string())
  }
}

impl From<String> for CacheKey {
  fn from(key: String) -> Self {
    Self(key)
  }
}

/// Build a key from a resource type, an optional tenant and ordered params.
///
/// A missing (or empty) tenant maps to the `public` scope.
pub fn build_key(resource: &str, tenant_id: Option<&str>, params: &[Value]) -> CacheKey {
  let scope = match tenant_id {
    Some(id) if !id.is_empty() => format!("{}:{}", TENANT_PREFIX, escape_segment(id)),
    _ => PUBLIC_SCOPE.to_string(),
  };

  let mut canonical = String::new();
  write_canonical(&Value::Array(params.to_vec()), &mut canonical);

  let params = if canonical.len() > MAX_PARAMS_LEN {
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("#{}", hex::encode(hasher.finalize()))
  } else {
    canonical
  };

  CacheKey(format!("{}:{}:{}", escape_segment(resource), scope, params))
}

/// Builder for keys whose params are arbitrary serializable values.
///
/// ```ignore
/// let key = CacheKeyBuilder::new("products_list")
///   .tenant(Some(&company_id))
///   .param(&filters)?
///   .param(&page)?
///   .build();
/// ```
#[derive(Debug, Clone)]
pub struct CacheKeyBuilder {
  resource: String,
  tenant_id: Option<String>,
  params: Vec<Value>,
}

impl CacheKeyBuilder {
  pub fn new(resource: impl Into<String>) -> Self {
    Self {
      resource: resource.into(),
      tenant_id: None,
      params: Vec::new(),
    }
  }

  pub fn tenant(mut self, tenant_id: Option<&str>) -> Self {
    self.tenant_id = tenant_id.map(String::from);
    self
  }

  /// Append a discriminating parameter. Order of params is significant.
  pub fn param<P: Serialize + ?Sized>(mut self, param: &P) -> Result<Self, serde_json::Error> {
    self.params.push(serde_json::to_value(param)?);
    Ok(self)
  }

  pub fn build(&self) -> CacheKey {
    build_key(&self.resource, self.tenant_id.as_deref(), &self.params)
  }
}

/// Escape characters that carry meaning in keys or patterns.
pub(crate) fn escape_segment(input: &str) -> String {
  input
    .replace('%', "%25")
    .replace(':', "%3A")
    .replace('*', "%2A")
}

/// Serialize JSON with object fields sorted at every depth.
fn write_canonical(value: &Value, out: &mut String) {
  match value {
    Value::Array(items) => {
      out.push('[');
      for (i, item) in items.iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        write_canonical(item, out);
      }
      out.push(']');
    }
    Value::Object(map) => {
      let mut fields: Vec<(&String, &Value)> = map.iter().collect();
      fields.sort_by(|a, b| a.0.cmp(b.0));

      out.push('{');
      for (i, (name, item)) in fields.into_iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        out.push_str(&Value::String(name.clone()).to_string());
        out.push(':');
        write_canonical(item, out);
      }
      out.push('}');
    }
    scalar => out.push_str(&scalar.to_string()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_same_query_same_key() {
    let a = build_key("products_list", Some("tenantA"), &[json!({"search": "x"})]);
    let b = build_key("products_list", Some("tenantA"), &[json!({"search": "x"})]);
    assert_eq!(a, b);
  }

  #[test]
  fn test_different_filters_different_keys() {
    let a = build_key("products_list", Some("tenantA"), &[json!({"search": "x"})]);
    let b = build_key("products_list", Some("tenantA"), &[json!({"search": "y"})]);
    assert_ne!(a, b);
  }

  #[test]
  fn test_field_order_is_canonical() {
    let a = build_key(
      "reports",
      Some("T1"),
      &[json!({"from": "2024-01-01", "to": "2024-02-01", "nested": {"b": 1, "a": 2}})],
    );

    let mut reordered = serde_json::Map::new();
    reordered.insert("nested".into(), json!({"a": 2, "b": 1}));
    reordered.insert("to".into(), json!("2024-02-01"));
    reordered.insert("from".into(), json!("2024-01-01"));
    let b = build_key("reports", Some("T1"), &[Value::Object(reordered)]);

    assert_eq!(a, b);
  }

  #[test]
  fn test_param_order_is_significant() {
    let a = build_key("products_list", Some("T1"), &[json!(1), json!(2)]);
    let b = build_key("products_list", Some("T1"), &[json!(2), json!(1)]);
    assert_ne!(a, b);
  }

  #[test]
  fn test_missing_tenant_uses_public_sentinel() {
    let none = build_key("catalog", None, &[]);
    let empty = build_key("catalog", Some(""), &[]);
    assert_eq!(none.as_str(), "catalog:public:[]");
    assert_eq!(none, empty);
  }

  #[test]
  fn test_key_shape() {
    let key = build_key("products_list", Some("T1"), &[json!({"search": "x"}), json!(2)]);
    assert_eq!(key.as_str(), r#"products_list:company:T1:[{"search":"x"},2]"#);
  }

  #[test]
  fn test_tenant_segment_is_escaped() {
    let spoofed = build_key("dashboard", Some("T1:company:T2"), &[]);
    assert_eq!(spoofed.as_str(), "dashboard:company:T1%3Acompany%3AT2:[]");
  }

  #[test]
  fn test_long_params_are_hashed() {
    let long = "x".repeat(500);
    let a = build_key("reports", Some("T1"), &[json!({ "q": long })]);
    let b = build_key("reports", Some("T1"), &[json!({ "q": "x".repeat(501) })]);

    assert!(a.as_str().starts_with("reports:company:T1:#"));
    assert_eq!(a.as_str().len(), "reports:company:T1:#".len() + 64);
    assert_ne!(a, b);
  }

  #[derive(Serialize)]
  struct ProductFilters {
    search: String,
    category: Option<String>,
  }

  #[test]
  fn test_builder_matches_build_key() {
    let filters = ProductFilters {
      search: "x".into(),
      category: None,
    };
    let built = CacheKeyBuilder::new("products_list")
      .tenant(Some("T1"))
      .param(&filters)
      .unwrap()
      .param(&3)
      .unwrap()
      .build();

    let direct = build_key(
      "products_list",
      Some("T1"),
      &[json!({"category": null, "search": "x"}), json!(3)],
    );
    assert_eq!(built, direct);
  }
}
