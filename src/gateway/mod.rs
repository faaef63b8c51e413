//! Offline-Aware Request Gateway: the single entry point for network calls.
//!
//! Reads take a cache-first/network-first hybrid path depending on the
//! monitor's last-known connectivity; writes either go straight to the
//! network or into the replay queue. Queued writes are returned as a
//! distinct variant so callers can render pending state instead of treating
//! the write as applied.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use crate::connectivity::ConnectivityMonitor;
use crate::error::{Result, SyncError};
use crate::net::{HttpRequest, HttpResponse, Method, Transport};
use crate::queue::{Priority, ReplayQueue};
use crate::store::{KeyValueStore, Namespace};

/// Closed request configuration. Unrecognized fields are rejected when
/// options are deserialized from caller-supplied data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestOptions {
  pub url: String,
  #[serde(default = "default_method")]
  pub method: Method,
  #[serde(default)]
  pub headers: Vec<(String, String)>,
  #[serde(default)]
  pub body: Option<Vec<u8>>,
  /// Cache key override; derived from method and URL when absent.
  #[serde(default)]
  pub cache_key: Option<String>,
  /// TTL override for the cached response, in seconds.
  #[serde(default)]
  pub ttl_secs: Option<u64>,
  #[serde(default = "default_priority")]
  pub priority: Priority,
}

fn default_method() -> Method {
  Method::Get
}

fn default_priority() -> Priority {
  Priority::Normal
}

impl RequestOptions {
  pub fn new(method: Method, url: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      method,
      headers: Vec::new(),
      body: None,
      cache_key: None,
      ttl_secs: None,
      priority: default_priority(),
    }
  }

  pub fn get(url: impl Into<String>) -> Self {
    Self::new(Method::Get, url)
  }

  pub fn with_body(mut self, body: Vec<u8>) -> Self {
    self.body = Some(body);
    self
  }

  pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
    self.cache_key = Some(key.into());
    self
  }

  pub fn with_ttl_secs(mut self, ttl_secs: u64) -> Self {
    self.ttl_secs = Some(ttl_secs);
    self
  }

  pub fn with_priority(mut self, priority: Priority) -> Self {
    self.priority = priority;
    self
  }

  fn validate(&self) -> Result<()> {
    if self.url.is_empty() {
      return Err(SyncError::InvalidOptions("url must not be empty".to_string()));
    }
    Ok(())
  }

  fn to_http_request(&self) -> HttpRequest {
    HttpRequest {
      url: self.url.clone(),
      method: self.method,
      headers: self.headers.clone(),
      body: self.body.clone(),
    }
  }
}

/// A cached read response. Valid only while `now - stored_at < ttl`;
/// expired entries are treated as absent rather than deleted eagerly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
  pub key: String,
  pub payload: Vec<u8>,
  pub stored_at: DateTime<Utc>,
  pub ttl_secs: u64,
}

impl CacheEntry {
  pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
    let age = now.signed_duration_since(self.stored_at);
    age < chrono::Duration::seconds(self.ttl_secs as i64)
  }
}

/// Result of a gateway request, distinguishing where the data came from and
/// whether a write has actually been applied.
#[derive(Debug, Clone)]
pub enum GatewayResponse {
  /// Fresh response from the network.
  Fetched(HttpResponse),
  /// Served from the durable cache (offline, or network fallback).
  Cached {
    body: Vec<u8>,
    stored_at: DateTime<Utc>,
  },
  /// Write captured for later replay; not yet applied server-side.
  Queued { id: String },
}

impl GatewayResponse {
  /// Response body, if any data was returned.
  pub fn body(&self) -> Option<&[u8]> {
    match self {
      GatewayResponse::Fetched(response) => Some(&response.body),
      GatewayResponse::Cached { body, .. } => Some(body),
      GatewayResponse::Queued { .. } => None,
    }
  }

  pub fn is_queued(&self) -> bool {
    matches!(self, GatewayResponse::Queued { .. })
  }
}

/// Derive a stable cache key from the request shape, matching the hashing
/// used for queue ids.
pub fn derived_cache_key(method: Method, url: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(method.as_str().as_bytes());
  hasher.update(b":");
  hasher.update(url.as_bytes());
  hex::encode(hasher.finalize())
}

pub struct Gateway {
  store: Arc<dyn KeyValueStore>,
  monitor: Arc<ConnectivityMonitor>,
  queue: Arc<ReplayQueue>,
  transport: Arc<dyn Transport>,
  default_ttl_secs: u64,
  request_timeout: Duration,
}

impl Gateway {
  pub fn new(
    store: Arc<dyn KeyValueStore>,
    monitor: Arc<ConnectivityMonitor>,
    queue: Arc<ReplayQueue>,
    transport: Arc<dyn Transport>,
    default_ttl_secs: u64,
    request_timeout: Duration,
  ) -> Self {
    Self {
      store,
      monitor,
      queue,
      transport,
      default_ttl_secs,
      request_timeout,
    }
  }

  /// Perform a network operation with offline awareness.
  ///
  /// The routing decision reads the monitor's last-known state and never
  /// waits for an in-flight probe.
  pub async fn request(&self, options: RequestOptions) -> Result<GatewayResponse> {
    options.validate()?;

    if options.method.is_mutating() {
      self.write(options).await
    } else {
      self.read(options).await
    }
  }

  async fn read(&self, options: RequestOptions) -> Result<GatewayResponse> {
    let key = options
      .cache_key
      .clone()
      .unwrap_or_else(|| derived_cache_key(options.method, &options.url));

    if !self.monitor.should_attempt_network() {
      // Offline: no network attempt at all.
      return match self.lookup_cache(&key)? {
        Some(entry) => Ok(GatewayResponse::Cached {
          body: entry.payload,
          stored_at: entry.stored_at,
        }),
        None => Err(SyncError::NoCachedData(key)),
      };
    }

    let request = options.to_http_request();
    let network_error = match self.transport.send(&request, self.request_timeout).await {
      Ok(response) if response.is_success() => {
        self.store_cache_entry(&key, &options, &response);
        return Ok(GatewayResponse::Fetched(response));
      }
      Ok(response) => SyncError::NetworkFailure(format!(
        "{} returned HTTP {}",
        options.url, response.status
      )),
      Err(e) if e.is_transient() => {
        // The monitor said online but the call failed: stale-state race.
        // Kick off a re-probe without blocking this request.
        let monitor = Arc::clone(&self.monitor);
        tokio::spawn(async move {
          monitor.force_probe().await;
        });
        e
      }
      Err(e) => return Err(e),
    };

    match self.lookup_cache(&key)? {
      Some(entry) => {
        tracing::debug!(%key, "network read failed, serving cached entry");
        Ok(GatewayResponse::Cached {
          body: entry.payload,
          stored_at: entry.stored_at,
        })
      }
      None => Err(network_error),
    }
  }

  async fn write(&self, options: RequestOptions) -> Result<GatewayResponse> {
    let request = options.to_http_request();

    if self.monitor.should_attempt_network() {
      // Online writes are direct; success and failure both propagate
      // without queuing.
      let response = self
        .transport
        .send(&request, self.request_timeout)
        .await
        .map_err(|e| {
          if e.is_transient() {
            let monitor = Arc::clone(&self.monitor);
            tokio::spawn(async move {
              monitor.force_probe().await;
            });
          }
          e
        })?;
      return Ok(GatewayResponse::Fetched(response));
    }

    let entry = self.queue.enqueue(request, options.priority)?;
    Ok(GatewayResponse::Queued { id: entry.id })
  }

  fn lookup_cache(&self, key: &str) -> Result<Option<CacheEntry>> {
    let Some(bytes) = self.store.get(&Namespace::Cache, key)? else {
      return Ok(None);
    };

    let entry: CacheEntry = match serde_json::from_slice(&bytes) {
      Ok(entry) => entry,
      Err(e) => {
        tracing::warn!(key, error = %e, "dropping unreadable cache entry");
        return Ok(None);
      }
    };

    // Lazy invalidation: expired entries read as absent.
    if entry.is_valid(Utc::now()) {
      Ok(Some(entry))
    } else {
      Ok(None)
    }
  }

  /// Cache writes are best-effort; a full store must not fail the read.
  fn store_cache_entry(&self, key: &str, options: &RequestOptions, response: &HttpResponse) {
    let entry = CacheEntry {
      key: key.to_string(),
      payload: response.body.clone(),
      stored_at: Utc::now(),
      ttl_secs: options.ttl_secs.unwrap_or(self.default_ttl_secs),
    };

    let result = serde_json::to_vec(&entry)
      .map_err(SyncError::from)
      .and_then(|bytes| self.store.set(&Namespace::Cache, key, &bytes));
    if let Err(e) = result {
      tracing::warn!(key, error = %e, "failed to cache response");
    }
  }
}
