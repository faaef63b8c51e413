//! offramp: an offline-tolerant synchronization layer.
//!
//! The crate keeps a client application usable when the network path is
//! absent or unreliable: reads are served from a durable cache, mutating
//! requests are queued and replayed in priority order on reconnect, form
//! state is auto-saved locally and mirrored to the server opportunistically,
//! and a background proxy agent applies a network-first cache policy to
//! static traffic at the transport boundary.
//!
//! [`SyncEngine`] is the assembled context object: construct it, `start` it,
//! route application traffic through [`Gateway::request`], and `shutdown`
//! when done. Connectivity state is owned by the engine's
//! [`ConnectivityMonitor`], never by a global.

pub mod agent;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod event;
pub mod forms;
pub mod gateway;
pub mod net;
pub mod queue;
pub mod store;

pub use config::SyncConfig;
pub use connectivity::{ConnectivityMonitor, ConnectivityState, HttpProber, Prober};
pub use error::{Result, SyncError};
pub use event::{EventBus, SyncEvent};
pub use forms::{FormManager, FormRecord};
pub use gateway::{CacheEntry, Gateway, GatewayResponse, RequestOptions};
pub use net::{HttpRequest, HttpResponse, HttpTransport, Method, Transport};
pub use queue::{DrainReport, Priority, QueuedRequest, ReplayQueue};
pub use store::{FallbackStore, KeyValueStore, MemoryStore, Namespace, SqliteStore};

use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// The assembled synchronization layer.
///
/// Lifecycle: `new` (or [`SyncEngine::with_parts`] with injected seams) →
/// [`SyncEngine::start`] → [`SyncEngine::shutdown`]. Components communicate
/// through the shared store and the event bus; the engine owns the tasks that
/// react to reconnects (queue drain, pending form sync).
pub struct SyncEngine {
  config: SyncConfig,
  store: Arc<dyn KeyValueStore>,
  transport: Arc<dyn Transport>,
  bus: EventBus,
  monitor: Arc<ConnectivityMonitor>,
  queue: Arc<ReplayQueue>,
  gateway: Arc<Gateway>,
  forms: Arc<FormManager>,
  drain_task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
  /// Build the engine with the production seams: SQLite storage (degrading
  /// to memory when the durable write path fails) and a reqwest transport.
  pub fn new(config: SyncConfig) -> Result<Self> {
    let durable: Arc<dyn KeyValueStore> = match &config.data_dir {
      Some(dir) => Arc::new(SqliteStore::open_at(&dir.join("store.db"))?),
      None => Arc::new(SqliteStore::open()?),
    };
    let store: Arc<dyn KeyValueStore> = Arc::new(FallbackStore::new(durable));

    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new());
    let prober: Arc<dyn Prober> = Arc::new(HttpProber::new(
      transport.clone(),
      config.liveness_url.clone(),
      config.probe_timeout(),
    ));

    Self::with_parts(config, store, transport, prober)
  }

  /// Build the engine from explicit seams. Tests inject an in-memory store
  /// and fake transport/prober here.
  pub fn with_parts(
    config: SyncConfig,
    store: Arc<dyn KeyValueStore>,
    transport: Arc<dyn Transport>,
    prober: Arc<dyn Prober>,
  ) -> Result<Self> {
    let bus = EventBus::new();

    let monitor = Arc::new(ConnectivityMonitor::new(
      prober,
      store.clone(),
      bus.clone(),
      config.offline_probe_interval(),
    ));

    let queue = Arc::new(ReplayQueue::new(
      store.clone(),
      transport.clone(),
      config.max_replay_attempts,
      config.request_timeout(),
    )?);

    let gateway = Arc::new(Gateway::new(
      store.clone(),
      monitor.clone(),
      queue.clone(),
      transport.clone(),
      config.default_cache_ttl_secs,
      config.request_timeout(),
    ));

    let forms = Arc::new(FormManager::new(
      store.clone(),
      monitor.clone(),
      transport.clone(),
      config.request_timeout(),
      config.autosave_interval(),
    ));

    Ok(Self {
      config,
      store,
      transport,
      bus,
      monitor,
      queue,
      gateway,
      forms,
      drain_task: Mutex::new(None),
    })
  }

  /// Start the background machinery: the monitor's probe loop, the form
  /// manager's reconnect listener, and the queue drain on every
  /// Offline→Online transition.
  pub fn start(&self) {
    self.monitor.start();
    self.forms.start(self.bus.subscribe());

    let queue = self.queue.clone();
    let mut events = self.bus.subscribe();
    let handle = tokio::spawn(async move {
      loop {
        match events.recv().await {
          Ok(SyncEvent::ConnectivityChanged { online: true }) => match queue.drain().await {
            Ok(report) => {
              if !report.succeeded.is_empty() || !report.dead_lettered.is_empty() {
                tracing::info!(
                  succeeded = report.succeeded.len(),
                  failed = report.failed.len(),
                  dead_lettered = report.dead_lettered.len(),
                  "replay queue drained after reconnect"
                );
              }
            }
            Err(e) => tracing::warn!(error = %e, "queue drain failed"),
          },
          Ok(_) => {}
          Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
          Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
      }
    });

    let mut task = self.drain_task.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(old) = task.replace(handle) {
      old.abort();
    }
  }

  /// Stop all background tasks. Pending queue entries and form records stay
  /// in the durable store for the next session.
  pub fn shutdown(&self) {
    self.monitor.stop();
    self.forms.stop();
    let mut task = self.drain_task.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(handle) = task.take() {
      handle.abort();
    }
  }

  pub fn config(&self) -> &SyncConfig {
    &self.config
  }

  pub fn store(&self) -> &Arc<dyn KeyValueStore> {
    &self.store
  }

  pub fn events(&self) -> &EventBus {
    &self.bus
  }

  pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
    &self.monitor
  }

  pub fn queue(&self) -> &Arc<ReplayQueue> {
    &self.queue
  }

  pub fn gateway(&self) -> &Arc<Gateway> {
    &self.gateway
  }

  pub fn forms(&self) -> &Arc<FormManager> {
    &self.forms
  }

  /// Construct the Background Proxy Agent over the engine's store, transport,
  /// and event bus. The agent is run in its own task by the caller; it shares
  /// no other state with the foreground components.
  pub fn build_agent(&self) -> Arc<agent::ProxyAgent> {
    Arc::new(agent::ProxyAgent::new(
      self.store.clone(),
      self.transport.clone(),
      self.bus.clone(),
      &self.config,
    ))
  }
}

impl Drop for SyncEngine {
  fn drop(&mut self) {
    self.shutdown();
  }
}
