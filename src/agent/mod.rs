//! Background Proxy Agent: request interception at the transport boundary.
//!
//! The agent runs as its own task, independent of any foreground view. It
//! pre-populates a versioned asset cache on install, serves intercepted
//! requests network-first with cache fallback, and garbage-collects stale
//! cache versions on activation. Requests under the reserved API prefix are
//! never cached here; the gateway's cache policy owns that traffic.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::SyncConfig;
use crate::error::Result;
use crate::event::{EventBus, SyncEvent};
use crate::net::{HttpRequest, HttpResponse, Method, Transport};
use crate::store::{KeyValueStore, Namespace};

/// Control messages from the hosting application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentControl {
  /// Version-bump takeover: activate now instead of waiting.
  Activate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AgentPhase {
  Installing,
  /// Installed, waiting for the activation message.
  Waiting,
  Active,
}

pub struct ProxyAgent {
  store: Arc<dyn KeyValueStore>,
  transport: Arc<dyn Transport>,
  bus: EventBus,
  /// Versioned cache name; the only asset namespace allowed to survive
  /// activation.
  cache_name: String,
  asset_manifest: Vec<String>,
  api_prefix: String,
  request_timeout: Duration,
  phase: Mutex<AgentPhase>,
}

impl ProxyAgent {
  pub fn new(
    store: Arc<dyn KeyValueStore>,
    transport: Arc<dyn Transport>,
    bus: EventBus,
    config: &SyncConfig,
  ) -> Self {
    Self {
      store,
      transport,
      bus,
      cache_name: config.agent.cache_version.clone(),
      asset_manifest: config.agent.asset_manifest.clone(),
      api_prefix: config.api_prefix.clone(),
      request_timeout: config.request_timeout(),
      phase: Mutex::new(AgentPhase::Installing),
    }
  }

  fn assets_namespace(&self) -> Namespace {
    Namespace::Assets(self.cache_name.clone())
  }

  fn set_phase(&self, phase: AgentPhase) {
    *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = phase;
  }

  pub fn is_active(&self) -> bool {
    *self.phase.lock().unwrap_or_else(|e| e.into_inner()) == AgentPhase::Active
  }

  /// Pre-populate the versioned cache from the asset manifest. Individual
  /// fetch and store failures are logged and skipped; the remaining assets
  /// still install. Returns the number of assets cached.
  pub async fn install(&self) -> usize {
    let namespace = self.assets_namespace();
    let mut cached = 0;

    for url in &self.asset_manifest {
      let request = HttpRequest::new(Method::Get, url.clone());
      match self.transport.send(&request, self.request_timeout).await {
        Ok(response) if response.is_success() => {
          let stored = serde_json::to_vec(&response)
            .map_err(crate::error::SyncError::from)
            .and_then(|bytes| self.store.set(&namespace, url, &bytes));
          match stored {
            Ok(()) => cached += 1,
            Err(e) => tracing::warn!(%url, error = %e, "failed to store asset"),
          }
        }
        Ok(response) => {
          tracing::warn!(%url, status = response.status, "asset install skipped")
        }
        Err(e) => tracing::warn!(%url, error = %e, "asset install failed"),
      }
    }

    self.set_phase(AgentPhase::Waiting);
    tracing::info!(cache = %self.cache_name, cached, "asset cache installed");
    self.bus.emit(SyncEvent::CacheInstallComplete {
      cache: self.cache_name.clone(),
      assets: cached,
    });

    cached
  }

  /// Take over: delete every asset cache whose name is not in the allow-list
  /// (currently just this agent's version), preventing unbounded growth
  /// across versions.
  pub fn activate(&self) -> Result<()> {
    let current = self.assets_namespace().as_str();

    for namespace in self.store.list_namespaces()? {
      if namespace.starts_with(Namespace::ASSETS_PREFIX) && namespace != current {
        tracing::info!(cache = %namespace, "removing stale asset cache");
        self.store.clear_namespace(&namespace)?;
      }
    }

    self.set_phase(AgentPhase::Active);
    self.bus.emit(SyncEvent::AgentActivated {
      cache: self.cache_name.clone(),
    });

    Ok(())
  }

  /// Intercept an outbound request.
  ///
  /// API-prefixed requests pass straight through so this layer never
  /// double-caches data the gateway owns. Everything else is network-first:
  /// a successful GET is copied into the cache best-effort; a transport
  /// failure falls back to the cached copy if one exists.
  pub async fn intercept(&self, request: &HttpRequest) -> Result<HttpResponse> {
    if self.is_api_request(&request.url) {
      return self.transport.send(request, self.request_timeout).await;
    }

    match self.transport.send(request, self.request_timeout).await {
      Ok(response) => {
        if response.is_success() && request.method == Method::Get {
          self.cache_put(&request.url, &response);
        }
        Ok(response)
      }
      Err(network_error) => match self.cache_match(&request.url)? {
        Some(cached) => {
          tracing::debug!(url = %request.url, "serving intercepted request from cache");
          Ok(cached)
        }
        None => Err(network_error),
      },
    }
  }

  /// Consume control messages until the hosting application hangs up.
  /// This is the agent's dedicated task; `install` runs first, activation
  /// happens on the version-bump message.
  pub async fn run(self: Arc<Self>, mut control: mpsc::Receiver<AgentControl>) -> Result<()> {
    self.install().await;

    while let Some(message) = control.recv().await {
      match message {
        AgentControl::Activate => self.activate()?,
      }
    }

    Ok(())
  }

  fn is_api_request(&self, url: &str) -> bool {
    let path = match url::Url::parse(url) {
      Ok(parsed) => parsed.path().to_string(),
      // Relative URL: treat the part before any query as the path.
      Err(_) => url.split('?').next().unwrap_or(url).to_string(),
    };
    path.starts_with(&self.api_prefix)
  }

  /// Best-effort cache write; failures never fail the intercepted request.
  fn cache_put(&self, url: &str, response: &HttpResponse) {
    let result = serde_json::to_vec(response)
      .map_err(crate::error::SyncError::from)
      .and_then(|bytes| self.store.set(&self.assets_namespace(), url, &bytes));
    if let Err(e) = result {
      tracing::warn!(url, error = %e, "failed to cache intercepted response");
    }
  }

  fn cache_match(&self, url: &str) -> Result<Option<HttpResponse>> {
    let Some(bytes) = self.store.get(&self.assets_namespace(), url)? else {
      return Ok(None);
    };
    match serde_json::from_slice(&bytes) {
      Ok(response) => Ok(Some(response)),
      Err(e) => {
        tracing::warn!(url, error = %e, "dropping unreadable cached asset");
        Ok(None)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::SyncError;
  use crate::store::MemoryStore;
  use futures::future::BoxFuture;
  use std::sync::atomic::{AtomicBool, Ordering};

  struct ScriptedTransport {
    sent: Mutex<Vec<String>>,
    fail: AtomicBool,
  }

  impl ScriptedTransport {
    fn new() -> Arc<Self> {
      Arc::new(Self {
        sent: Mutex::new(Vec::new()),
        fail: AtomicBool::new(false),
      })
    }

    fn sent_urls(&self) -> Vec<String> {
      self.sent.lock().unwrap().clone()
    }
  }

  impl Transport for ScriptedTransport {
    fn send<'a>(
      &'a self,
      request: &'a HttpRequest,
      _timeout: Duration,
    ) -> BoxFuture<'a, Result<HttpResponse>> {
      self.sent.lock().unwrap().push(request.url.clone());
      let fail = self.fail.load(Ordering::SeqCst);
      let body = format!("body-of:{}", request.url).into_bytes();
      Box::pin(async move {
        if fail {
          Err(SyncError::NetworkFailure("offline".to_string()))
        } else {
          Ok(HttpResponse {
            status: 200,
            headers: Vec::new(),
            body,
          })
        }
      })
    }
  }

  fn agent_with(
    store: Arc<dyn KeyValueStore>,
    transport: Arc<ScriptedTransport>,
    cache_version: &str,
    manifest: Vec<String>,
  ) -> (Arc<ProxyAgent>, EventBus) {
    let bus = EventBus::new();
    let config = SyncConfig {
      agent: crate::config::AgentConfig {
        cache_version: cache_version.to_string(),
        asset_manifest: manifest,
      },
      ..SyncConfig::default()
    };
    let agent = Arc::new(ProxyAgent::new(store, transport, bus.clone(), &config));
    (agent, bus)
  }

  #[tokio::test]
  async fn test_install_populates_versioned_cache_and_emits_event() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let transport = ScriptedTransport::new();
    let (agent, bus) = agent_with(
      store.clone(),
      transport,
      "assets-v2",
      vec!["/index.html".to_string(), "/app.js".to_string()],
    );
    let mut rx = bus.subscribe();

    let cached = agent.install().await;
    assert_eq!(cached, 2);

    let namespace = Namespace::Assets("assets-v2".to_string());
    assert_eq!(store.list_keys(&namespace).unwrap().len(), 2);

    match rx.try_recv() {
      Ok(SyncEvent::CacheInstallComplete { cache, assets }) => {
        assert_eq!(cache, "assets-v2");
        assert_eq!(assets, 2);
      }
      other => panic!("unexpected event: {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_install_survives_storage_failure_per_asset() {
    struct FullDisk;

    impl KeyValueStore for FullDisk {
      fn get(&self, _namespace: &Namespace, _key: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
      }

      fn set(&self, _namespace: &Namespace, _key: &str, _value: &[u8]) -> Result<()> {
        Err(SyncError::StorageUnavailable("disk full".to_string()))
      }

      fn remove(&self, _namespace: &Namespace, _key: &str) -> Result<()> {
        Ok(())
      }

      fn list_keys(&self, _namespace: &Namespace) -> Result<Vec<String>> {
        Ok(Vec::new())
      }

      fn list_namespaces(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
      }

      fn clear_namespace(&self, _namespace: &str) -> Result<()> {
        Ok(())
      }
    }

    let transport = ScriptedTransport::new();
    let (agent, bus) = agent_with(
      Arc::new(FullDisk),
      transport.clone(),
      "assets-v1",
      vec!["/index.html".to_string(), "/app.js".to_string()],
    );
    let mut rx = bus.subscribe();

    // Every asset is still attempted; the pass completes with nothing cached.
    let cached = agent.install().await;
    assert_eq!(cached, 0);
    assert_eq!(transport.sent_urls().len(), 2);
    assert!(matches!(
      rx.try_recv(),
      Ok(SyncEvent::CacheInstallComplete { assets: 0, .. })
    ));
  }

  #[tokio::test]
  async fn test_intercept_is_network_first_with_cache_fallback() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let transport = ScriptedTransport::new();
    let (agent, _bus) = agent_with(store, transport.clone(), "assets-v1", Vec::new());

    let request = HttpRequest::new(Method::Get, "https://shop.example.com/app.js");

    // First fetch succeeds and is copied into the cache.
    let response = agent.intercept(&request).await.unwrap();
    assert!(response.is_success());

    // Network gone: the cached copy is served.
    transport.fail.store(true, Ordering::SeqCst);
    let fallback = agent.intercept(&request).await.unwrap();
    assert_eq!(fallback.body, response.body);
  }

  #[tokio::test]
  async fn test_intercept_failure_without_cache_surfaces_error() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let transport = ScriptedTransport::new();
    transport.fail.store(true, Ordering::SeqCst);
    let (agent, _bus) = agent_with(store, transport, "assets-v1", Vec::new());

    let request = HttpRequest::new(Method::Get, "https://shop.example.com/missing.js");
    let err = agent.intercept(&request).await.unwrap_err();
    assert!(err.is_transient());
  }

  #[tokio::test]
  async fn test_api_prefix_is_never_cached_here() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let transport = ScriptedTransport::new();
    let (agent, _bus) = agent_with(store.clone(), transport.clone(), "assets-v1", Vec::new());

    let request = HttpRequest::new(Method::Get, "https://shop.example.com/api/deals");
    agent.intercept(&request).await.unwrap();

    // Passed through, nothing stored in the asset cache.
    assert_eq!(transport.sent_urls().len(), 1);
    let namespace = Namespace::Assets("assets-v1".to_string());
    assert!(store.list_keys(&namespace).unwrap().is_empty());

    // And no fallback either: API traffic is the gateway's concern.
    transport.fail.store(true, Ordering::SeqCst);
    assert!(agent.intercept(&request).await.is_err());
  }

  #[tokio::test]
  async fn test_activation_gc_keeps_only_allowed_cache() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    store
      .set(&Namespace::Assets("assets-v1".to_string()), "/a", b"old")
      .unwrap();
    store
      .set(&Namespace::Assets("assets-v2".to_string()), "/a", b"new")
      .unwrap();
    // Non-asset namespaces are untouched.
    store.set(&Namespace::Cache, "deals", b"x").unwrap();

    let transport = ScriptedTransport::new();
    let (agent, bus) = agent_with(store.clone(), transport, "assets-v2", Vec::new());
    let mut rx = bus.subscribe();

    agent.activate().unwrap();

    assert!(store
      .list_keys(&Namespace::Assets("assets-v1".to_string()))
      .unwrap()
      .is_empty());
    assert_eq!(
      store
        .list_keys(&Namespace::Assets("assets-v2".to_string()))
        .unwrap()
        .len(),
      1
    );
    assert_eq!(store.get(&Namespace::Cache, "deals").unwrap(), Some(b"x".to_vec()));
    assert!(agent.is_active());
    assert!(matches!(
      rx.try_recv(),
      Ok(SyncEvent::AgentActivated { cache }) if cache == "assets-v2"
    ));
  }

  #[tokio::test]
  async fn test_version_bump_message_forces_takeover() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let transport = ScriptedTransport::new();
    let (agent, _bus) = agent_with(store, transport, "assets-v3", Vec::new());

    let (tx, rx) = mpsc::channel(4);
    let handle = tokio::spawn(Arc::clone(&agent).run(rx));

    tx.send(AgentControl::Activate).await.unwrap();
    drop(tx);
    handle.await.unwrap().unwrap();

    assert!(agent.is_active());
  }
}
