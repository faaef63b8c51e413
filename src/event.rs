//! Typed event bus connecting the synchronization components.
//!
//! Platform callbacks (online/offline signals, agent lifecycle hooks) are
//! modeled as explicit event variants delivered over a broadcast channel.
//! Components that react to connectivity changes subscribe and consume events
//! in their own task.

use tokio::sync::broadcast;

/// Events published by the synchronization layer.
#[derive(Debug, Clone)]
pub enum SyncEvent {
  /// The Connectivity Monitor confirmed a state change via probe.
  ConnectivityChanged { online: bool },
  /// The Background Proxy Agent finished pre-populating its asset cache.
  CacheInstallComplete { cache: String, assets: usize },
  /// A new Background Proxy Agent version took over.
  AgentActivated { cache: String },
}

/// Broadcast bus for [`SyncEvent`]s.
///
/// Slow subscribers may observe `Lagged` and miss events; every consumer in
/// this crate treats events as triggers to re-read authoritative state, so a
/// missed event is recovered on the next one.
#[derive(Clone)]
pub struct EventBus {
  tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
  pub fn new() -> Self {
    let (tx, _rx) = broadcast::channel(64);
    Self { tx }
  }

  /// Subscribe to all future events.
  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.tx.subscribe()
  }

  /// Publish an event. Succeeds even with no subscribers.
  pub fn emit(&self, event: SyncEvent) {
    let _ = self.tx.send(event);
  }
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new()
  }
}
