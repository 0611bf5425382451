//! Cache error types

use thiserror::Error;

/// Errors surfaced by the cache client and the query cache facade
#[derive(Debug, Clone, Error)]
pub enum CacheError {
  /// The host or configuration cannot support caching at all
  #[error("configuration error: {0}")]
  Configuration(String),

  /// No usable connection to the backing store
  #[error("connection error: {0}")]
  Connection(String),

  /// A store command failed
  #[error("{op} failed: {message}")]
  Transport { op: &'static str, message: String },

  /// A value could not be encoded to or decoded from JSON
  #[error("serialization error: {0}")]
  Serialization(String),
}

impl CacheError {
  pub fn transport(op: &'static str, message: impl Into<String>) -> Self {
    CacheError::Transport {
      op,
      message: message.into(),
    }
  }

  pub fn is_connection(&self) -> bool {
    matches!(self, CacheError::Connection(_))
  }
}

impl From<serde_json::Error> for CacheError {
  fn from(e: serde_json::Error) -> Self {
    CacheError::Serialization(e.to_string())
  }
}
