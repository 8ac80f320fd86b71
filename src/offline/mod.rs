//! Offline support: connectivity signal, durable local storage and the
//! write queue that captures mutations while the backend is unreachable.

mod connectivity;
mod queue;
mod storage;

pub use connectivity::Connectivity;
pub use queue::{
  DrainReport, OfflineQueue, OperationKind, QueuedOperation, QUARANTINE_STORAGE_KEY,
  QUEUE_STORAGE_KEY,
};
pub use storage::{LocalStorage, MemoryLocalStorage, SqliteLocalStorage};
