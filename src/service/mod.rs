//! The backend data service as seen by the cache layer.
//!
//! The service is an external collaborator: the cache layer only needs to
//! read a row and apply a mutation. Everything else (auth, schemas, business
//! rules) lives behind it.

mod rest;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ServiceError;
use crate::offline::{OperationKind, QueuedOperation};

pub use rest::RestDataService;

#[async_trait]
pub trait DataService: Send + Sync {
  /// Fetch a single row by id. A missing row is `ServiceError::NotFound`.
  async fn fetch(&self, table: &str, id: &str) -> Result<Value, ServiceError>;

  /// Apply a mutation and return the authoritative row (or `Null` for
  /// deletes). Updates and deletes identify the row by `data["id"]`.
  async fn write(&self, kind: OperationKind, table: &str, data: &Value) -> Result<Value, ServiceError>;
}

/// Replay a queued operation against the service.
pub async fn apply_queued(service: &dyn DataService, op: &QueuedOperation) -> Result<(), ServiceError> {
  service.write(op.kind, &op.table, &op.data).await.map(|_| ())
}

/// Row id carried in a mutation payload.
pub(crate) fn row_id(data: &Value) -> Option<String> {
  match data.get("id")? {
    Value::String(id) => Some(id.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

#[cfg(test)]
pub(crate) mod testing {
  use super::*;
  use std::collections::HashMap;
  use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
  use std::sync::Mutex;

  /// In-memory data service with switchable failure modes.
  #[derive(Default)]
  pub struct FakeDataService {
    pub rows: Mutex<HashMap<(String, String), Value>>,
    pub unreachable: AtomicBool,
    pub fetches: AtomicU32,
    pub writes: Mutex<Vec<(OperationKind, String, Value)>>,
  }

  impl FakeDataService {
    pub fn with_row(self, table: &str, id: &str, row: Value) -> Self {
      self
        .rows
        .lock()
        .unwrap()
        .insert((table.to_string(), id.to_string()), row);
      self
    }

    pub fn set_unreachable(&self, unreachable: bool) {
      self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn row(&self, table: &str, id: &str) -> Option<Value> {
      self
        .rows
        .lock()
        .unwrap()
        .get(&(table.to_string(), id.to_string()))
        .cloned()
    }

    fn check(&self) -> Result<(), ServiceError> {
      if self.unreachable.load(Ordering::SeqCst) {
        Err(ServiceError::unavailable("connection refused"))
      } else {
        Ok(())
      }
    }
  }

  #[async_trait]
  impl DataService for FakeDataService {
    async fn fetch(&self, table: &str, id: &str) -> Result<Value, ServiceError> {
      self.fetches.fetch_add(1, Ordering::SeqCst);
      self.check()?;
      self
        .row(table, id)
        .ok_or_else(|| ServiceError::not_found(table, id))
    }

    async fn write(&self, kind: OperationKind, table: &str, data: &Value) -> Result<Value, ServiceError> {
      self.check()?;
      self
        .writes
        .lock()
        .unwrap()
        .push((kind, table.to_string(), data.clone()));

      let id = row_id(data).ok_or_else(|| ServiceError::validation("missing id"))?;
      let key = (table.to_string(), id.clone());
      let mut rows = self.rows.lock().unwrap();
      match kind {
        OperationKind::Insert => {
          rows.insert(key, data.clone());
          Ok(data.clone())
        }
        OperationKind::Update => {
          let row = rows
            .get_mut(&key)
            .ok_or_else(|| ServiceError::not_found(table, &id))?;
          if let (Some(row), Some(changes)) = (row.as_object_mut(), data.as_object()) {
            for (field, value) in changes {
              row.insert(field.clone(), value.clone());
            }
          }
          Ok(row.clone())
        }
        OperationKind::Delete => {
          rows.remove(&key);
          Ok(Value::Null)
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::testing::FakeDataService;
  use super::*;
  use serde_json::json;

  #[test]
  fn test_row_id() {
    assert_eq!(row_id(&json!({"id": "c1"})), Some("c1".into()));
    assert_eq!(row_id(&json!({"id": 7})), Some("7".into()));
    assert_eq!(row_id(&json!({"name": "x"})), None);
  }

  #[tokio::test]
  async fn test_apply_queued() {
    let service = FakeDataService::default().with_row("products", "p1", json!({"id": "p1", "price": 1}));
    let op = QueuedOperation {
      id: "op-1".into(),
      kind: OperationKind::Update,
      table: "products".into(),
      data: json!({"id": "p1", "price": 2}),
      timestamp: 0,
    };

    apply_queued(&service, &op).await.unwrap();
    assert_eq!(service.row("products", "p1").unwrap()["price"], 2);
  }
}
