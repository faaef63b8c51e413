//! Request Replay Queue: durable queue of deferred mutating requests.
//!
//! Requests enqueued while offline are replayed in priority order once
//! connectivity returns. Replay is at-least-once; idempotency is the
//! caller/server contract (client-generated idempotency keys in the request
//! body), the queue performs no deduplication.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::net::{HttpRequest, Transport};
use crate::store::{KeyValueStore, Namespace};

/// Replay priority. Declaration order defines drain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
  High,
  Normal,
  Low,
}

/// A persisted description of a deferred mutating call.
///
/// `request` is replayed byte-for-byte as originally captured. `seq` is a
/// store-wide monotonic counter providing FIFO order within a priority tier
/// even when wall-clock timestamps collide.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedRequest {
  pub id: String,
  pub request: HttpRequest,
  pub priority: Priority,
  pub enqueued_at: DateTime<Utc>,
  pub seq: u64,
  pub attempts: u32,
}

/// Outcome of one drain pass, by request id.
#[derive(Debug, Default)]
pub struct DrainReport {
  pub succeeded: Vec<String>,
  /// Requests that failed this pass and remain queued for a later drain.
  pub failed: Vec<String>,
  /// One [`SyncError::QueueExhausted`] per request that used up its replay
  /// budget and moved to dead letters.
  pub dead_lettered: Vec<SyncError>,
}

/// Durable replay queue over the local store.
pub struct ReplayQueue {
  store: Arc<dyn KeyValueStore>,
  transport: Arc<dyn Transport>,
  max_attempts: u32,
  request_timeout: Duration,
  next_seq: AtomicU64,
  // Serializes drain passes; enqueue stays concurrent.
  drain_lock: tokio::sync::Mutex<()>,
}

impl ReplayQueue {
  /// Build the queue, seeding the sequence counter from whatever survived
  /// the last process so FIFO order holds across restarts.
  pub fn new(
    store: Arc<dyn KeyValueStore>,
    transport: Arc<dyn Transport>,
    max_attempts: u32,
    request_timeout: Duration,
  ) -> Result<Self> {
    let queue = Self {
      store,
      transport,
      max_attempts,
      request_timeout,
      next_seq: AtomicU64::new(0),
      drain_lock: tokio::sync::Mutex::new(()),
    };

    let max_seq = queue
      .load_namespace(&Namespace::Queue)?
      .into_iter()
      .chain(queue.load_namespace(&Namespace::DeadLetter)?)
      .map(|entry| entry.seq)
      .max();
    if let Some(max_seq) = max_seq {
      queue.next_seq.store(max_seq + 1, Ordering::SeqCst);
    }

    Ok(queue)
  }

  /// Persist a request for later replay at the given priority.
  pub fn enqueue(&self, request: HttpRequest, priority: Priority) -> Result<QueuedRequest> {
    let enqueued_at = Utc::now();
    let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);

    let mut hasher = Sha256::new();
    hasher.update(request.method.as_str().as_bytes());
    hasher.update(request.url.as_bytes());
    hasher.update(seq.to_be_bytes());
    hasher.update(enqueued_at.timestamp_nanos_opt().unwrap_or_default().to_be_bytes());
    let id = hex::encode(hasher.finalize());

    let entry = QueuedRequest {
      id: id.clone(),
      request,
      priority,
      enqueued_at,
      seq,
      attempts: 0,
    };

    self.persist(&Namespace::Queue, &entry)?;
    tracing::debug!(%id, ?priority, url = %entry.request.url, "queued request for replay");

    Ok(entry)
  }

  /// All pending requests in drain order: priority tiers high before normal
  /// before low, FIFO within a tier.
  pub fn peek_all(&self) -> Result<Vec<QueuedRequest>> {
    let mut entries = self.load_namespace(&Namespace::Queue)?;
    entries.sort_by_key(|e| (e.priority, e.seq));
    Ok(entries)
  }

  /// Requests that exhausted their replay budget, awaiting explicit
  /// user-triggered re-initiation or discard.
  pub fn dead_letters(&self) -> Result<Vec<QueuedRequest>> {
    let mut entries = self.load_namespace(&Namespace::DeadLetter)?;
    entries.sort_by_key(|e| (e.priority, e.seq));
    Ok(entries)
  }

  /// Drop a request from the queue or the dead-letter listing.
  pub fn discard(&self, id: &str) -> Result<()> {
    self.store.remove(&Namespace::Queue, id)?;
    self.store.remove(&Namespace::DeadLetter, id)?;
    Ok(())
  }

  /// Replay every pending request once, in order.
  ///
  /// Each attempt is independent: neither a network nor a storage failure on
  /// one entry blocks the rest of the pass. Failed requests keep their
  /// original priority; a request whose attempt count reaches the configured
  /// maximum moves to the dead-letter listing and is reported as
  /// [`SyncError::QueueExhausted`] instead of being retried again.
  pub async fn drain(&self) -> Result<DrainReport> {
    let _guard = self.drain_lock.lock().await;

    let entries = self.peek_all()?;
    let mut report = DrainReport::default();

    if entries.is_empty() {
      return Ok(report);
    }
    tracing::info!(pending = entries.len(), "draining replay queue");

    for mut entry in entries {
      let outcome = self.transport.send(&entry.request, self.request_timeout).await;

      match outcome {
        Ok(response) if response.is_success() => {
          // The server applied the request. A failed removal leaves the
          // entry for a redundant later replay, which at-least-once
          // delivery already tolerates.
          if let Err(e) = self.store.remove(&Namespace::Queue, &entry.id) {
            tracing::warn!(id = %entry.id, error = %e, "failed to remove replayed request");
          }
          tracing::debug!(id = %entry.id, "replayed queued request");
          report.succeeded.push(entry.id);
        }
        _ => {
          entry.attempts += 1;
          if entry.attempts >= self.max_attempts {
            match self
              .store
              .remove(&Namespace::Queue, &entry.id)
              .and_then(|()| self.persist(&Namespace::DeadLetter, &entry))
            {
              Ok(()) => {
                tracing::warn!(
                  id = %entry.id,
                  attempts = entry.attempts,
                  "queued request exhausted replay budget, dead-lettered"
                );
                report.dead_lettered.push(SyncError::QueueExhausted {
                  id: entry.id,
                  attempts: entry.attempts,
                });
              }
              Err(e) => {
                tracing::warn!(id = %entry.id, error = %e, "failed to dead-letter request");
                report.failed.push(entry.id);
              }
            }
          } else {
            if let Err(e) = self.persist(&Namespace::Queue, &entry) {
              tracing::warn!(id = %entry.id, error = %e, "failed to persist replay attempt count");
            }
            report.failed.push(entry.id);
          }
        }
      }
    }

    Ok(report)
  }

  fn persist(&self, namespace: &Namespace, entry: &QueuedRequest) -> Result<()> {
    let bytes = serde_json::to_vec(entry)?;
    self.store.set(namespace, &entry.id, &bytes)
  }

  fn load_namespace(&self, namespace: &Namespace) -> Result<Vec<QueuedRequest>> {
    let mut entries = Vec::new();
    for key in self.store.list_keys(namespace)? {
      match self.store.get(namespace, &key)? {
        Some(bytes) => match serde_json::from_slice(&bytes) {
          Ok(entry) => entries.push(entry),
          Err(e) => {
            tracing::warn!(%key, error = %e, "dropping unreadable queue entry")
          }
        },
        None => {}
      }
    }
    Ok(entries)
  }
}
