//! Durable key/value local storage for client-side state.

use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::db::Database;
use crate::error::QueueError;

/// Synchronous string key/value storage.
///
/// `set_item` replaces the whole value atomically: a reader sees either the
/// previous value or the new one, never a partial write.
pub trait LocalStorage: Send + Sync {
  fn get_item(&self, key: &str) -> Result<Option<String>, QueueError>;

  fn set_item(&self, key: &str, value: &str) -> Result<(), QueueError>;

  fn remove_item(&self, key: &str) -> Result<(), QueueError>;
}

/// Local storage backed by the shared SQLite database.
pub struct SqliteLocalStorage {
  db: Arc<Database>,
}

impl SqliteLocalStorage {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

impl LocalStorage for SqliteLocalStorage {
  fn get_item(&self, key: &str) -> Result<Option<String>, QueueError> {
    let conn = self
      .db
      .lock()
      .map_err(|e| QueueError::Storage(e.to_string()))?;

    let value = conn
      .query_row(
        "SELECT value FROM local_storage WHERE item_key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()?;

    Ok(value)
  }

  fn set_item(&self, key: &str, value: &str) -> Result<(), QueueError> {
    let conn = self
      .db
      .lock()
      .map_err(|e| QueueError::Storage(e.to_string()))?;

    conn.execute(
      "INSERT OR REPLACE INTO local_storage (item_key, value, updated_at)
       VALUES (?, ?, datetime('now'))",
      params![key, value],
    )?;

    Ok(())
  }

  fn remove_item(&self, key: &str) -> Result<(), QueueError> {
    let conn = self
      .db
      .lock()
      .map_err(|e| QueueError::Storage(e.to_string()))?;

    conn.execute("DELETE FROM local_storage WHERE item_key = ?", params![key])?;
    Ok(())
  }
}

/// Volatile local storage, for tests and sessions without a data directory.
#[derive(Default)]
pub struct MemoryLocalStorage {
  items: Mutex<HashMap<String, String>>,
}

impl MemoryLocalStorage {
  pub fn new() -> Self {
    Self::default()
  }
}

impl LocalStorage for MemoryLocalStorage {
  fn get_item(&self, key: &str) -> Result<Option<String>, QueueError> {
    let items = self
      .items
      .lock()
      .map_err(|e| QueueError::Storage(format!("Lock poisoned: {}", e)))?;
    Ok(items.get(key).cloned())
  }

  fn set_item(&self, key: &str, value: &str) -> Result<(), QueueError> {
    let mut items = self
      .items
      .lock()
      .map_err(|e| QueueError::Storage(format!("Lock poisoned: {}", e)))?;
    items.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove_item(&self, key: &str) -> Result<(), QueueError> {
    let mut items = self
      .items
      .lock()
      .map_err(|e| QueueError::Storage(format!("Lock poisoned: {}", e)))?;
    items.remove(key);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn exercise(storage: &dyn LocalStorage) {
    assert_eq!(storage.get_item("k").unwrap(), None);
    storage.set_item("k", "[1]").unwrap();
    storage.set_item("k", "[1,2]").unwrap();
    assert_eq!(storage.get_item("k").unwrap().as_deref(), Some("[1,2]"));
    storage.remove_item("k").unwrap();
    storage.remove_item("k").unwrap();
    assert_eq!(storage.get_item("k").unwrap(), None);
  }

  #[test]
  fn test_sqlite_local_storage() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    exercise(&SqliteLocalStorage::new(db));
  }

  #[test]
  fn test_memory_local_storage() {
    exercise(&MemoryLocalStorage::new());
  }
}
