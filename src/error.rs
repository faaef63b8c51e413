//! Error taxonomy for the synchronization layer.
//!
//! Transient network errors (timeouts, connection failures) are the ones the
//! replay queue and the gateway's cache fallback are built for; everything
//! else is a caller or environment problem and propagates unchanged.

use std::time::Duration;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
  /// The durable store rejected an operation (disk full, locked, missing).
  #[error("storage unavailable: {0}")]
  StorageUnavailable(String),

  /// Offline read with no valid cache entry under the given key.
  #[error("no cached data for key {0}")]
  NoCachedData(String),

  /// The request did not complete within the configured timeout.
  #[error("network timeout after {0:?}")]
  NetworkTimeout(Duration),

  /// Connection-level failure: DNS, refused, reset, TLS.
  #[error("network failure: {0}")]
  NetworkFailure(String),

  /// A queued request used up its replay budget and was dead-lettered.
  #[error("request {id} exhausted its replay budget after {attempts} attempts")]
  QueueExhausted { id: String, attempts: u32 },

  /// Caller-supplied request options failed validation.
  #[error("invalid request options: {0}")]
  InvalidOptions(String),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("configuration error: {0}")]
  Config(String),
}

impl SyncError {
  /// Whether the error is expected to clear on its own once connectivity
  /// returns. Transient errors drive re-probes and queue replay; permanent
  /// ones surface to the caller immediately.
  pub fn is_transient(&self) -> bool {
    matches!(
      self,
      SyncError::NetworkTimeout(_) | SyncError::NetworkFailure(_)
    )
  }
}
