//! Connectivity Monitor: probe-verified online/offline state.
//!
//! Platform connectivity signals are unreliable (a device can report "online"
//! while the backend is unreachable), so every signal is treated only as a
//! trigger to re-probe. State flips exclusively on probe outcomes.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::event::{EventBus, SyncEvent};
use crate::net::{HttpRequest, Method, Transport};
use crate::store::{KeyValueStore, Namespace};

const LAST_ONLINE_KEY: &str = "last_online_at";

/// Internal link state. `Unknown` exists only between construction and the
/// first probe result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
  Unknown,
  Online,
  Offline,
}

/// Snapshot of the monitor's knowledge at a point in time.
#[derive(Debug, Clone)]
pub struct ConnectivityState {
  pub is_online: bool,
  pub last_online_at: Option<DateTime<Utc>>,
  pub consecutive_probe_failures: u32,
}

/// Trait for liveness probes. A probe returns `true` only when the backend
/// answered with a success status within the timeout.
pub trait Prober: Send + Sync {
  fn probe(&self) -> BoxFuture<'_, bool>;
}

/// Prober that issues a cache-busting HEAD request to the liveness endpoint.
pub struct HttpProber {
  transport: Arc<dyn Transport>,
  url: String,
  timeout: Duration,
}

impl HttpProber {
  pub fn new(transport: Arc<dyn Transport>, url: impl Into<String>, timeout: Duration) -> Self {
    Self {
      transport,
      url: url.into(),
      timeout,
    }
  }
}

impl Prober for HttpProber {
  fn probe(&self) -> BoxFuture<'_, bool> {
    Box::pin(async move {
      // Unique query parameter defeats any intermediary cache.
      let separator = if self.url.contains('?') { '&' } else { '?' };
      let url = format!(
        "{}{}probe={}",
        self.url,
        separator,
        Utc::now().timestamp_micros()
      );

      let mut request = HttpRequest::new(Method::Head, url);
      request
        .headers
        .push(("cache-control".to_string(), "no-cache".to_string()));
      request
        .headers
        .push(("pragma".to_string(), "no-cache".to_string()));

      match self.transport.send(&request, self.timeout).await {
        Ok(response) => response.is_success(),
        Err(_) => false,
      }
    })
  }
}

struct MonitorInner {
  link: LinkState,
  last_online_at: Option<DateTime<Utc>>,
  consecutive_probe_failures: u32,
}

/// Probe-verified connectivity state machine.
///
/// Lifecycle: `new` → `start` (immediate probe plus a fixed-interval re-probe
/// loop while not online) → `stop`. State is never restored from persisted
/// values; each session starts from a fresh probe.
pub struct ConnectivityMonitor {
  prober: Arc<dyn Prober>,
  store: Arc<dyn KeyValueStore>,
  bus: EventBus,
  reprobe_interval: Duration,
  inner: Mutex<MonitorInner>,
  task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectivityMonitor {
  pub fn new(
    prober: Arc<dyn Prober>,
    store: Arc<dyn KeyValueStore>,
    bus: EventBus,
    reprobe_interval: Duration,
  ) -> Self {
    Self {
      prober,
      store,
      bus,
      reprobe_interval,
      inner: Mutex::new(MonitorInner {
        link: LinkState::Unknown,
        last_online_at: None,
        consecutive_probe_failures: 0,
      }),
      task: Mutex::new(None),
    }
  }

  /// Last-known state. Callers do not block on an in-flight probe;
  /// connectivity knowledge is eventually consistent by design.
  pub fn current_state(&self) -> ConnectivityState {
    let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
    ConnectivityState {
      is_online: inner.link == LinkState::Online,
      last_online_at: inner.last_online_at,
      consecutive_probe_failures: inner.consecutive_probe_failures,
    }
  }

  /// Whether the gateway should attempt the network. `Unknown` counts as
  /// reachable: the first request races the first probe, and its own failure
  /// path falls back to cache anyway.
  pub fn should_attempt_network(&self) -> bool {
    let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
    inner.link != LinkState::Offline
  }

  /// Run a probe now and apply the resulting state transition.
  /// Returns the probe outcome.
  pub async fn force_probe(&self) -> bool {
    let success = self.prober.probe().await;
    self.apply_probe_result(success);
    success
  }

  /// Feed a platform online/offline signal. Never trusted directly: an
  /// "online" signal flips state only after a confirming probe succeeds, and
  /// an "offline" signal is likewise verified before flipping.
  pub async fn platform_signal(&self, online_hint: bool) -> bool {
    tracing::debug!(online_hint, "platform connectivity signal, re-probing");
    self.force_probe().await
  }

  fn apply_probe_result(&self, success: bool) {
    let changed = {
      let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
      let previous = inner.link;

      if success {
        inner.consecutive_probe_failures = 0;
        inner.last_online_at = Some(Utc::now());
        inner.link = LinkState::Online;
      } else {
        inner.consecutive_probe_failures += 1;
        inner.link = LinkState::Offline;
      }

      (previous != inner.link).then_some(inner.link)
    };

    if success {
      self.persist_last_online();
    }

    if let Some(link) = changed {
      let online = link == LinkState::Online;
      tracing::info!(online, "connectivity state changed");
      self.bus.emit(SyncEvent::ConnectivityChanged { online });
    }
  }

  /// Best-effort bookkeeping; a full store must not break probing.
  fn persist_last_online(&self) {
    let now = Utc::now().to_rfc3339();
    if let Err(e) = self
      .store
      .set(&Namespace::Meta, LAST_ONLINE_KEY, now.as_bytes())
    {
      tracing::debug!(error = %e, "failed to persist last-online timestamp");
    }
  }

  /// Last successfully persisted online timestamp, for diagnostics.
  pub fn persisted_last_online(&self) -> Result<Option<DateTime<Utc>>> {
    let raw = self.store.get(&Namespace::Meta, LAST_ONLINE_KEY)?;
    Ok(raw.and_then(|bytes| {
      std::str::from_utf8(&bytes)
        .ok()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
    }))
  }

  /// Run the initial probe and spawn the re-probe loop. The loop probes on a
  /// fixed interval whenever the last-known state is not online, instead of
  /// waiting for platform signals that can be missed or delayed.
  pub fn start(self: &Arc<Self>) {
    let monitor = Arc::clone(self);
    let handle = tokio::spawn(async move {
      monitor.force_probe().await;

      let mut ticker = tokio::time::interval(monitor.reprobe_interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
      ticker.tick().await; // first tick fires immediately

      loop {
        ticker.tick().await;
        if !monitor.current_state().is_online {
          monitor.force_probe().await;
        }
      }
    });

    let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(old) = task.replace(handle) {
      old.abort();
    }
  }

  /// Stop the re-probe loop.
  pub fn stop(&self) {
    let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(handle) = task.take() {
      handle.abort();
    }
  }
}

impl Drop for ConnectivityMonitor {
  fn drop(&mut self) {
    self.stop();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::MemoryStore;
  use std::sync::atomic::{AtomicBool, Ordering};

  struct FakeProber {
    reachable: AtomicBool,
  }

  impl FakeProber {
    fn new(reachable: bool) -> Arc<Self> {
      Arc::new(Self {
        reachable: AtomicBool::new(reachable),
      })
    }

    fn set_reachable(&self, reachable: bool) {
      self.reachable.store(reachable, Ordering::SeqCst);
    }
  }

  impl Prober for FakeProber {
    fn probe(&self) -> BoxFuture<'_, bool> {
      let result = self.reachable.load(Ordering::SeqCst);
      Box::pin(async move { result })
    }
  }

  fn monitor_with(prober: Arc<FakeProber>) -> (Arc<ConnectivityMonitor>, EventBus) {
    let bus = EventBus::new();
    let monitor = Arc::new(ConnectivityMonitor::new(
      prober,
      Arc::new(MemoryStore::new()),
      bus.clone(),
      Duration::from_secs(30),
    ));
    (monitor, bus)
  }

  #[tokio::test]
  async fn test_unknown_to_online_on_probe_success() {
    let (monitor, _bus) = monitor_with(FakeProber::new(true));

    assert!(!monitor.current_state().is_online);
    assert!(monitor.force_probe().await);

    let state = monitor.current_state();
    assert!(state.is_online);
    assert!(state.last_online_at.is_some());
    assert_eq!(state.consecutive_probe_failures, 0);
  }

  #[tokio::test]
  async fn test_probe_overrides_platform_online_signal() {
    let (monitor, _bus) = monitor_with(FakeProber::new(false));

    // Platform claims online, but the confirming probe fails.
    assert!(!monitor.platform_signal(true).await);
    assert!(!monitor.current_state().is_online);
    assert_eq!(monitor.current_state().consecutive_probe_failures, 1);
  }

  #[tokio::test]
  async fn test_platform_offline_signal_with_reachable_backend_stays_online() {
    let prober = FakeProber::new(true);
    let (monitor, _bus) = monitor_with(prober.clone());

    monitor.force_probe().await;
    assert!(monitor.current_state().is_online);

    // Link-layer blip reported, but the confirmation probe still succeeds.
    monitor.platform_signal(false).await;
    assert!(monitor.current_state().is_online);
  }

  #[tokio::test]
  async fn test_offline_to_online_emits_event() {
    let prober = FakeProber::new(false);
    let (monitor, bus) = monitor_with(prober.clone());
    let mut rx = bus.subscribe();

    monitor.force_probe().await;
    prober.set_reachable(true);
    monitor.force_probe().await;

    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
      if let SyncEvent::ConnectivityChanged { online } = event {
        seen.push(online);
      }
    }
    assert_eq!(seen, vec![false, true]);
  }

  #[tokio::test]
  async fn test_failure_counter_accumulates_and_resets() {
    let prober = FakeProber::new(false);
    let (monitor, _bus) = monitor_with(prober.clone());

    monitor.force_probe().await;
    monitor.force_probe().await;
    monitor.force_probe().await;
    assert_eq!(monitor.current_state().consecutive_probe_failures, 3);

    prober.set_reachable(true);
    monitor.force_probe().await;
    assert_eq!(monitor.current_state().consecutive_probe_failures, 0);
  }

  #[tokio::test]
  async fn test_last_online_persisted_to_store() {
    let (monitor, _bus) = monitor_with(FakeProber::new(true));

    monitor.force_probe().await;
    assert!(monitor.persisted_last_online().unwrap().is_some());
  }
}
