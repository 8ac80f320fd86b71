//! Cache backends: SQLite (persistent primary) and in-memory (fallback).

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::pattern::KeyPattern;
use super::traits::{CacheBackend, CacheEntry};
use crate::db::Database;
use crate::error::CacheError;

/// In-memory backend with the same TTL semantics as the persistent one.
///
/// Expired entries are dropped lazily on read and on `len`.
#[derive(Default)]
pub struct MemoryBackend {
  entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryBackend {
  pub fn new() -> Self {
    Self::default()
  }

  fn entries(&self) -> Result<MutexGuard<'_, HashMap<String, CacheEntry>>, CacheError> {
    self
      .entries
      .lock()
      .map_err(|e| CacheError::Backend(format!("Lock poisoned: {}", e)))
  }

  /// Number of live entries, purging expired ones.
  pub fn live_len(&self) -> usize {
    match self.entries() {
      Ok(mut entries) => {
        let now = Utc::now();
        entries.retain(|_, entry| !entry.is_expired_at(now));
        entries.len()
      }
      Err(_) => 0,
    }
  }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
  fn name(&self) -> &'static str {
    "memory"
  }

  async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
    let mut entries = self.entries()?;
    match entries.get(key) {
      Some(entry) if entry.is_expired() => {
        entries.remove(key);
        Ok(None)
      }
      Some(entry) => Ok(Some(entry.value.clone())),
      None => Ok(None),
    }
  }

  async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
    self
      .entries()?
      .insert(key.to_string(), CacheEntry::new(key, value, ttl));
    Ok(())
  }

  async fn remove(&self, key: &str) -> Result<(), CacheError> {
    self.entries()?.remove(key);
    Ok(())
  }

  async fn remove_matching(&self, pattern: &KeyPattern) -> Result<u64, CacheError> {
    let mut entries = self.entries()?;
    let before = entries.len();
    entries.retain(|key, _| !pattern.matches(key));
    Ok((before - entries.len()) as u64)
  }

  async fn clear(&self) -> Result<(), CacheError> {
    self.entries()?.clear();
    Ok(())
  }

  async fn len(&self) -> Result<usize, CacheError> {
    Ok(self.live_len())
  }

  async fn ping(&self) -> Result<(), CacheError> {
    Ok(())
  }
}

/// SQLite-based persistent cache backend.
pub struct SqliteBackend {
  db: Arc<Database>,
}

impl SqliteBackend {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  fn conn(&self) -> Result<MutexGuard<'_, rusqlite::Connection>, CacheError> {
    self
      .db
      .lock()
      .map_err(|e| CacheError::Backend(e.to_string()))
  }
}

#[async_trait]
impl CacheBackend for SqliteBackend {
  fn name(&self) -> &'static str {
    "sqlite"
  }

  async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
    let conn = self.conn()?;

    let mut stmt = conn.prepare(
      "SELECT value, stored_at_ms, ttl_ms FROM cache_entries
       WHERE cache_key = ?",
    )?;

    let row: Option<(String, i64, i64)> = stmt
      .query_row(params![key], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
      .optional()?;

    let Some((value, stored_at_ms, ttl_ms)) = row else {
      return Ok(None);
    };

    let entry = CacheEntry {
      key: key.to_string(),
      value,
      stored_at: from_millis(stored_at_ms),
      ttl: Duration::from_millis(ttl_ms.max(0) as u64),
    };

    if entry.is_expired() {
      conn.execute("DELETE FROM cache_entries WHERE cache_key = ?", params![key])?;
      return Ok(None);
    }

    Ok(Some(entry.value))
  }

  async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);

    self.conn()?.execute(
      "INSERT OR REPLACE INTO cache_entries (cache_key, value, stored_at_ms, ttl_ms)
       VALUES (?, ?, ?, ?)",
      params![key, value, Utc::now().timestamp_millis(), ttl_ms],
    )?;

    Ok(())
  }

  async fn remove(&self, key: &str) -> Result<(), CacheError> {
    self
      .conn()?
      .execute("DELETE FROM cache_entries WHERE cache_key = ?", params![key])?;
    Ok(())
  }

  async fn remove_matching(&self, pattern: &KeyPattern) -> Result<u64, CacheError> {
    let mut conn = self.conn()?;

    let keys: Vec<String> = {
      let mut stmt = conn.prepare("SELECT cache_key FROM cache_entries")?;
      let keys = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
      keys
        .into_iter()
        .filter(|key| pattern.matches(key))
        .collect()
    };

    let tx = conn.transaction()?;
    for key in &keys {
      tx.execute("DELETE FROM cache_entries WHERE cache_key = ?", params![key])?;
    }
    tx.commit()?;

    Ok(keys.len() as u64)
  }

  async fn clear(&self) -> Result<(), CacheError> {
    self.conn()?.execute("DELETE FROM cache_entries", [])?;
    Ok(())
  }

  async fn len(&self) -> Result<usize, CacheError> {
    let conn = self.conn()?;
    conn.execute(
      "DELETE FROM cache_entries WHERE stored_at_ms + ttl_ms < ?",
      params![Utc::now().timestamp_millis()],
    )?;
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))?;
    Ok(count as usize)
  }

  async fn ping(&self) -> Result<(), CacheError> {
    self
      .conn()?
      .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
    Ok(())
  }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
  Utc
    .timestamp_millis_opt(ms)
    .single()
    .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sqlite() -> SqliteBackend {
    SqliteBackend::new(Arc::new(Database::open_in_memory().unwrap()))
  }

  async fn exercise_backend(backend: &dyn CacheBackend) {
    backend
      .set("a:company:T1:[]", "1", Duration::from_secs(60))
      .await
      .unwrap();
    backend
      .set("b:company:T1:[]", "2", Duration::from_secs(60))
      .await
      .unwrap();
    backend
      .set("a:company:T2:[]", "3", Duration::from_secs(60))
      .await
      .unwrap();

    assert_eq!(backend.get("a:company:T1:[]").await.unwrap(), Some("1".into()));
    assert_eq!(backend.len().await.unwrap(), 3);

    let removed = backend
      .remove_matching(&KeyPattern::tenant("T1"))
      .await
      .unwrap();
    assert_eq!(removed, 2);
    assert_eq!(backend.get("a:company:T1:[]").await.unwrap(), None);
    assert_eq!(backend.get("a:company:T2:[]").await.unwrap(), Some("3".into()));

    backend.remove("missing").await.unwrap();
    backend.remove("a:company:T2:[]").await.unwrap();
    assert_eq!(backend.len().await.unwrap(), 0);
  }

  #[tokio::test]
  async fn test_memory_backend() {
    exercise_backend(&MemoryBackend::new()).await;
  }

  #[tokio::test]
  async fn test_sqlite_backend() {
    exercise_backend(&sqlite()).await;
  }

  #[tokio::test]
  async fn test_expired_entries_are_misses() {
    for backend in [
      Box::new(MemoryBackend::new()) as Box<dyn CacheBackend>,
      Box::new(sqlite()),
    ] {
      backend
        .set("k", "v", Duration::from_millis(20))
        .await
        .unwrap();
      assert_eq!(backend.get("k").await.unwrap(), Some("v".into()));

      tokio::time::sleep(Duration::from_millis(40)).await;

      assert_eq!(backend.get("k").await.unwrap(), None, "{}", backend.name());
      assert_eq!(backend.len().await.unwrap(), 0);
    }
  }

  #[tokio::test]
  async fn test_set_resets_expiry_clock() {
    let backend = sqlite();
    backend
      .set("k", "v1", Duration::from_millis(50))
      .await
      .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    backend
      .set("k", "v2", Duration::from_millis(50))
      .await
      .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(backend.get("k").await.unwrap(), Some("v2".into()));
  }

  #[tokio::test]
  async fn test_sqlite_read_errors_are_not_misses() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    db.lock()
      .unwrap()
      .execute(
        "INSERT INTO cache_entries (cache_key, value, stored_at_ms, ttl_ms) VALUES ('k', 'v', 'garbage', 1000)",
        [],
      )
      .unwrap();
    let backend = SqliteBackend::new(db.clone());
    assert!(backend.get("k").await.is_err());

    db.lock()
      .unwrap()
      .execute_batch("DROP TABLE cache_entries")
      .unwrap();
    assert!(backend.get("other").await.is_err());
    assert!(backend.remove_matching(&KeyPattern::tenant("T1")).await.is_err());
  }

  #[tokio::test]
  async fn test_clear() {
    let backend = sqlite();
    backend.set("k", "v", Duration::from_secs(1)).await.unwrap();
    backend.clear().await.unwrap();
    assert_eq!(backend.get("k").await.unwrap(), None);
    backend.ping().await.unwrap();
  }
}
