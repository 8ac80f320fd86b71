//! Error taxonomy for the cache layer and its collaborators.

use thiserror::Error;

/// Failures reported by the backend data service.
///
/// The variants are grouped into classes that decide how callers recover:
/// infrastructure failures fall back to cached or synthetic data, not-found
/// may trigger self-healing, and authorization/validation failures are always
/// surfaced to the user.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
  #[error("Data service unavailable: {message}")]
  Unavailable { message: String },

  #[error("Data service timed out after {timeout_ms}ms")]
  Timeout { timeout_ms: u64 },

  #[error("Not found: {table}/{id}")]
  NotFound { table: String, id: String },

  #[error("Not authorized: {message}")]
  Unauthorized { message: String },

  #[error("Validation failed: {message}")]
  Validation { message: String },

  #[error("Failed to decode {table} response: {message}")]
  Decode { table: String, message: String },

  #[error("Data service error: {message}")]
  Other { message: String },
}

impl ServiceError {
  pub fn unavailable(message: impl Into<String>) -> Self {
    Self::Unavailable {
      message: message.into(),
    }
  }

  pub fn not_found(table: impl Into<String>, id: impl Into<String>) -> Self {
    Self::NotFound {
      table: table.into(),
      id: id.into(),
    }
  }

  pub fn unauthorized(message: impl Into<String>) -> Self {
    Self::Unauthorized {
      message: message.into(),
    }
  }

  pub fn validation(message: impl Into<String>) -> Self {
    Self::Validation {
      message: message.into(),
    }
  }

  pub fn decode(table: impl Into<String>, message: impl Into<String>) -> Self {
    Self::Decode {
      table: table.into(),
      message: message.into(),
    }
  }

  pub fn other(message: impl Into<String>) -> Self {
    Self::Other {
      message: message.into(),
    }
  }

  /// Backend or network could not be reached. Recovered locally.
  pub fn is_infrastructure(&self) -> bool {
    matches!(self, Self::Unavailable { .. } | Self::Timeout { .. })
  }

  pub fn is_not_found(&self) -> bool {
    matches!(self, Self::NotFound { .. })
  }

  /// Authorization and validation failures must reach the user unchanged.
  pub fn is_user_facing(&self) -> bool {
    matches!(self, Self::Unauthorized { .. } | Self::Validation { .. })
  }

  /// Whether a bounded retry could plausibly succeed.
  pub fn is_retryable(&self) -> bool {
    self.is_infrastructure() || matches!(self, Self::Other { .. })
  }
}

/// Failures of a cache backend. The store absorbs these; they never reach
/// callers of `get`/`set`.
#[derive(Error, Debug)]
pub enum CacheError {
  #[error("Cache backend error: {0}")]
  Backend(String),

  #[error("Cache serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for CacheError {
  fn from(err: rusqlite::Error) -> Self {
    Self::Backend(err.to_string())
  }
}

/// Failures of the offline write queue's durable storage.
#[derive(Error, Debug)]
pub enum QueueError {
  #[error("Local storage error: {0}")]
  Storage(String),

  #[error("Queue serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for QueueError {
  fn from(err: rusqlite::Error) -> Self {
    Self::Storage(err.to_string())
  }
}

/// Failures of a company profile write.
#[derive(Error, Debug)]
pub enum ProfileError {
  #[error("No company is associated with the current session")]
  NoCompany,

  #[error(transparent)]
  Service(#[from] ServiceError),

  #[error(transparent)]
  Queue(#[from] QueueError),
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_infrastructure_classification() {
    assert!(ServiceError::unavailable("connection refused").is_infrastructure());
    assert!(ServiceError::Timeout { timeout_ms: 10 }.is_infrastructure());
    assert!(!ServiceError::not_found("companies", "c1").is_infrastructure());
    assert!(!ServiceError::unauthorized("nope").is_infrastructure());
  }

  #[test]
  fn test_retryable_excludes_user_facing() {
    assert!(ServiceError::other("boom").is_retryable());
    assert!(!ServiceError::validation("bad name").is_retryable());
    assert!(!ServiceError::unauthorized("nope").is_retryable());
    assert!(!ServiceError::not_found("companies", "c1").is_retryable());
    assert!(ServiceError::validation("bad name").is_user_facing());
  }
}
