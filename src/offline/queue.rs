//! Persisted FIFO of mutations captured while offline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::connectivity::Connectivity;
use super::storage::LocalStorage;
use crate::error::{QueueError, ServiceError};

/// Local storage key holding the queue as a JSON array.
pub const QUEUE_STORAGE_KEY: &str = "offline_queue";

/// Where an unparsable persisted queue is moved so it is not overwritten.
pub const QUARANTINE_STORAGE_KEY: &str = "offline_queue.corrupt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
  Insert,
  Update,
  Delete,
}

impl OperationKind {
  pub fn as_str(self) -> &'static str {
    match self {
      OperationKind::Insert => "insert",
      OperationKind::Update => "update",
      OperationKind::Delete => "delete",
    }
  }
}

/// A mutation waiting for connectivity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
  pub id: String,
  #[serde(rename = "type")]
  pub kind: OperationKind,
  pub table: String,
  pub data: Value,
  /// Milliseconds since the Unix epoch
  pub timestamp: i64,
}

impl QueuedOperation {
  pub fn queued_at(&self) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(self.timestamp)
  }
}

/// Outcome of replaying the queue.
#[derive(Debug, Default)]
pub struct DrainReport {
  /// Operations applied and removed, in order
  pub applied: Vec<QueuedOperation>,
  /// Operations still queued after the drain
  pub remaining: usize,
  /// The failure that stopped the drain, with the operation it hit
  pub failed: Option<(QueuedOperation, ServiceError)>,
}

impl DrainReport {
  pub fn is_complete(&self) -> bool {
    self.failed.is_none() && self.remaining == 0
  }
}

/// Offline write queue.
///
/// Every change rewrites the whole persisted array in one `set_item`, so a
/// crash leaves either the old queue or the new one. Nothing is replayed
/// automatically: callers decide when to [`drain`](Self::drain), typically on
/// a connectivity transition.
pub struct OfflineQueue {
  storage: Arc<dyn LocalStorage>,
  operations: Mutex<Vec<QueuedOperation>>,
  connectivity: Connectivity,
  /// Held for a whole drain so overlapping replays run one after the other
  drain_lock: tokio::sync::Mutex<()>,
}

impl OfflineQueue {
  /// Load the queue from storage.
  ///
  /// A persisted value that does not parse is moved to
  /// [`QUARANTINE_STORAGE_KEY`] and the queue starts empty.
  pub fn load(storage: Arc<dyn LocalStorage>, connectivity: Connectivity) -> Result<Self, QueueError> {
    let operations = match storage.get_item(QUEUE_STORAGE_KEY)? {
      Some(raw) => match serde_json::from_str::<Vec<QueuedOperation>>(&raw) {
        Ok(operations) => operations,
        Err(e) => {
          error!(error = %e, "Persisted offline queue is corrupt, quarantining it");
          storage.set_item(QUARANTINE_STORAGE_KEY, &raw)?;
          storage.remove_item(QUEUE_STORAGE_KEY)?;
          Vec::new()
        }
      },
      None => Vec::new(),
    };

    if !operations.is_empty() {
      info!(pending = operations.len(), "Loaded offline queue");
    }

    Ok(Self {
      storage,
      operations: Mutex::new(operations),
      connectivity,
      drain_lock: tokio::sync::Mutex::new(()),
    })
  }

  pub fn is_online(&self) -> bool {
    self.connectivity.is_online()
  }

  pub fn connectivity(&self) -> &Connectivity {
    &self.connectivity
  }

  /// Append a mutation, assigning its id and timestamp, and persist the
  /// queue before returning.
  pub fn add(
    &self,
    kind: OperationKind,
    table: impl Into<String>,
    data: Value,
  ) -> Result<QueuedOperation, QueueError> {
    let op = QueuedOperation {
      id: Uuid::new_v4().to_string(),
      kind,
      table: table.into(),
      data,
      timestamp: Utc::now().timestamp_millis(),
    };

    let mut operations = self.operations()?;
    operations.push(op.clone());
    if let Err(e) = self.persist(&operations) {
      operations.pop();
      return Err(e);
    }

    info!(
      id = %op.id,
      kind = op.kind.as_str(),
      table = %op.table,
      pending = operations.len(),
      "Queued offline operation"
    );
    Ok(op)
  }

  /// Drop every queued operation, in memory and in storage.
  pub fn clear(&self) -> Result<(), QueueError> {
    let mut operations = self.operations()?;
    self.storage.remove_item(QUEUE_STORAGE_KEY)?;
    let dropped = operations.len();
    operations.clear();

    info!(dropped, "Cleared offline queue");
    Ok(())
  }

  /// Snapshot of the queued operations, oldest first.
  pub fn operations_snapshot(&self) -> Vec<QueuedOperation> {
    self.operations().map(|ops| ops.clone()).unwrap_or_default()
  }

  pub fn len(&self) -> usize {
    self.operations().map(|ops| ops.len()).unwrap_or_default()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Replay queued operations oldest first.
  ///
  /// Each operation is removed and the queue persisted as soon as `apply`
  /// succeeds. The drain stops at the first failure, leaving that operation
  /// and everything after it queued, since later mutations may depend on
  /// earlier ones.
  ///
  /// A drain started while another is running waits for it, then replays
  /// whatever is still queued.
  pub async fn drain<F, Fut>(&self, mut apply: F) -> Result<DrainReport, QueueError>
  where
    F: FnMut(QueuedOperation) -> Fut,
    Fut: Future<Output = Result<(), ServiceError>>,
  {
    let _draining = self.drain_lock.lock().await;
    let mut report = DrainReport::default();

    loop {
      let next = self.operations()?.first().cloned();
      let Some(op) = next else {
        break;
      };

      match apply(op.clone()).await {
        Ok(()) => {
          let mut operations = self.operations()?;
          if let Some(pos) = operations.iter().position(|queued| queued.id == op.id) {
            operations.remove(pos);
          }
          self.persist(&operations)?;
          report.applied.push(op);
        }
        Err(e) => {
          warn!(id = %op.id, table = %op.table, error = %e, "Offline queue drain stopped");
          report.failed = Some((op, e));
          break;
        }
      }
    }

    report.remaining = self.len();
    info!(
      applied = report.applied.len(),
      remaining = report.remaining,
      "Offline queue drained"
    );
    Ok(report)
  }

  fn operations(&self) -> Result<MutexGuard<'_, Vec<QueuedOperation>>, QueueError> {
    self
      .operations
      .lock()
      .map_err(|e| QueueError::Storage(format!("Lock poisoned: {}", e)))
  }

  fn persist(&self, operations: &[QueuedOperation]) -> Result<(), QueueError> {
    if operations.is_empty() {
      return self.storage.remove_item(QUEUE_STORAGE_KEY);
    }
    let raw = serde_json::to_string(operations)?;
    self.storage.set_item(QUEUE_STORAGE_KEY, &raw)
  }
}
