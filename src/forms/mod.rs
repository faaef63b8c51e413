//! Form Persistence Manager: local snapshots of in-progress forms with
//! opportunistic server sync.
//!
//! Every local save marks the record as pending sync; the flag clears only
//! when the snapshot has been mirrored server-side. Auto-save guards against
//! data loss on crash or navigation, independent of explicit user action.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::connectivity::ConnectivityMonitor;
use crate::error::{Result, SyncError};
use crate::event::SyncEvent;
use crate::net::{HttpRequest, Method, Transport};
use crate::store::{KeyValueStore, Namespace};

/// Persisted state of one logical form instance.
///
/// `offline_sync_pending` is maintained explicitly on every save and sync so
/// that a save landing in the same clock tick as a sync still reads as
/// pending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormRecord {
  pub form_id: String,
  pub snapshot: serde_json::Value,
  pub last_saved: Option<DateTime<Utc>>,
  pub last_synced_to_server: Option<DateTime<Utc>>,
  pub offline_sync_pending: bool,
}

impl FormRecord {
  fn new(form_id: &str) -> Self {
    Self {
      form_id: form_id.to_string(),
      snapshot: serde_json::Value::Null,
      last_saved: None,
      last_synced_to_server: None,
      offline_sync_pending: false,
    }
  }

  /// The timestamp form of the pending invariant. The stored flag must
  /// always imply this (modulo equal-timestamp saves, which the flag covers).
  pub fn staleness_by_timestamps(&self) -> bool {
    match (self.last_saved, self.last_synced_to_server) {
      (Some(saved), Some(synced)) => saved >= synced,
      (Some(_), None) => true,
      (None, _) => false,
    }
  }
}

type SnapshotProvider = Arc<dyn Fn() -> serde_json::Value + Send + Sync>;

pub struct FormManager {
  store: Arc<dyn KeyValueStore>,
  monitor: Arc<ConnectivityMonitor>,
  transport: Arc<dyn Transport>,
  request_timeout: Duration,
  /// Default interval for [`FormManager::enable_autosave`].
  autosave_interval: Duration,
  /// Sync endpoint per form, used for immediate and reconnect-triggered sync.
  endpoints: Mutex<HashMap<String, String>>,
  autosave_tasks: Mutex<HashMap<String, JoinHandle<()>>>,
  reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

impl FormManager {
  pub fn new(
    store: Arc<dyn KeyValueStore>,
    monitor: Arc<ConnectivityMonitor>,
    transport: Arc<dyn Transport>,
    request_timeout: Duration,
    autosave_interval: Duration,
  ) -> Self {
    Self {
      store,
      monitor,
      transport,
      request_timeout,
      autosave_interval,
      endpoints: Mutex::new(HashMap::new()),
      autosave_tasks: Mutex::new(HashMap::new()),
      reconnect_task: Mutex::new(None),
    }
  }

  /// Register the server endpoint used to mirror this form's snapshots.
  pub fn set_sync_endpoint(&self, form_id: &str, endpoint: impl Into<String>) {
    let mut endpoints = self.endpoints.lock().unwrap_or_else(|e| e.into_inner());
    endpoints.insert(form_id.to_string(), endpoint.into());
  }

  fn endpoint_for(&self, form_id: &str) -> Option<String> {
    let endpoints = self.endpoints.lock().unwrap_or_else(|e| e.into_inner());
    endpoints.get(form_id).cloned()
  }

  /// Save the form snapshot locally, then opportunistically mirror it to the
  /// server when online. When offline the record stays pending and is synced
  /// on the next reconnect.
  pub async fn save_form_state(&self, form_id: &str, snapshot: serde_json::Value) -> Result<()> {
    let mut record = self.load(form_id)?.unwrap_or_else(|| FormRecord::new(form_id));
    record.snapshot = snapshot;
    record.last_saved = Some(Utc::now());
    record.offline_sync_pending = true;
    self.persist(&record)?;

    if self.monitor.current_state().is_online {
      if let Some(endpoint) = self.endpoint_for(form_id) {
        // Transient sync failures are resolved on reconnect; the local
        // save already succeeded.
        if let Err(e) = self.sync_to_server(form_id, &endpoint).await {
          tracing::debug!(form_id, error = %e, "immediate form sync failed, left pending");
        }
      }
    }

    Ok(())
  }

  /// The last saved snapshot, if any.
  pub fn restore_form_state(&self, form_id: &str) -> Result<Option<serde_json::Value>> {
    Ok(self.load(form_id)?.map(|record| record.snapshot))
  }

  /// Full record including staleness metadata, for pending-state UI.
  pub fn record(&self, form_id: &str) -> Result<Option<FormRecord>> {
    self.load(form_id)
  }

  /// Destroy the record (explicit clear or completed submission). Also stops
  /// any auto-save task for the form.
  pub fn clear_form_state(&self, form_id: &str) -> Result<()> {
    self.disable_autosave(form_id);
    self.store.remove(&Namespace::Forms, form_id)
  }

  /// Mirror the latest snapshot to the server.
  ///
  /// Returns `Ok(false)` without contacting the network when nothing is
  /// unsynced. On success records the sync time and clears the pending flag.
  pub async fn sync_to_server(&self, form_id: &str, endpoint: &str) -> Result<bool> {
    let Some(mut record) = self.load(form_id)? else {
      return Ok(false);
    };
    if !record.offline_sync_pending {
      return Ok(false);
    }

    let mut request = HttpRequest::new(Method::Post, endpoint);
    request
      .headers
      .push(("content-type".to_string(), "application/json".to_string()));
    request.body = Some(serde_json::to_vec(&record.snapshot)?);

    let response = self.transport.send(&request, self.request_timeout).await?;
    if !response.is_success() {
      return Err(SyncError::NetworkFailure(format!(
        "form sync to {} returned HTTP {}",
        endpoint, response.status
      )));
    }

    record.last_synced_to_server = Some(Utc::now());
    record.offline_sync_pending = false;
    self.persist(&record)?;
    tracing::debug!(form_id, endpoint, "form snapshot synced to server");

    Ok(true)
  }

  /// Sync every pending form that has a registered endpoint. Failures are
  /// independent; returns the number of forms synced.
  pub async fn sync_pending(&self) -> usize {
    let endpoints: Vec<(String, String)> = {
      let map = self.endpoints.lock().unwrap_or_else(|e| e.into_inner());
      map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    };

    let mut synced = 0;
    for (form_id, endpoint) in endpoints {
      match self.sync_to_server(&form_id, &endpoint).await {
        Ok(true) => synced += 1,
        Ok(false) => {}
        Err(e) => tracing::warn!(%form_id, error = %e, "form sync failed, left pending"),
      }
    }
    synced
  }

  /// Save the provider's latest value on the configured default interval
  /// until disabled.
  pub fn enable_autosave(self: &Arc<Self>, form_id: &str, provider: SnapshotProvider) {
    self.enable_autosave_every(form_id, self.autosave_interval, provider);
  }

  /// Save the provider's latest value on an explicit interval until disabled.
  pub fn enable_autosave_every(
    self: &Arc<Self>,
    form_id: &str,
    interval: Duration,
    provider: SnapshotProvider,
  ) {
    self.disable_autosave(form_id);

    let manager = Arc::clone(self);
    let id = form_id.to_string();
    let handle = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
      ticker.tick().await; // skip the immediate first tick

      loop {
        ticker.tick().await;
        let snapshot = provider();
        if let Err(e) = manager.save_form_state(&id, snapshot).await {
          tracing::warn!(form_id = %id, error = %e, "auto-save failed");
        }
      }
    });

    let mut tasks = self.autosave_tasks.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(old) = tasks.insert(form_id.to_string(), handle) {
      old.abort();
    }
  }

  pub fn disable_autosave(&self, form_id: &str) {
    let mut tasks = self.autosave_tasks.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(handle) = tasks.remove(form_id) {
      handle.abort();
    }
  }

  /// Spawn the reconnect listener: every Offline→Online transition triggers
  /// a sync of all pending forms.
  pub fn start(self: &Arc<Self>, mut events: broadcast::Receiver<SyncEvent>) {
    let manager = Arc::clone(self);
    let handle = tokio::spawn(async move {
      loop {
        match events.recv().await {
          Ok(SyncEvent::ConnectivityChanged { online: true }) => {
            let synced = manager.sync_pending().await;
            if synced > 0 {
              tracing::info!(synced, "synced pending forms after reconnect");
            }
          }
          Ok(_) => {}
          Err(broadcast::error::RecvError::Lagged(_)) => continue,
          Err(broadcast::error::RecvError::Closed) => break,
        }
      }
    });

    let mut task = self.reconnect_task.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(old) = task.replace(handle) {
      old.abort();
    }
  }

  /// Abort all background tasks owned by the manager.
  pub fn stop(&self) {
    let mut tasks = self.autosave_tasks.lock().unwrap_or_else(|e| e.into_inner());
    for (_, handle) in tasks.drain() {
      handle.abort();
    }
    drop(tasks);

    let mut task = self.reconnect_task.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(handle) = task.take() {
      handle.abort();
    }
  }

  fn load(&self, form_id: &str) -> Result<Option<FormRecord>> {
    let Some(bytes) = self.store.get(&Namespace::Forms, form_id)? else {
      return Ok(None);
    };
    Ok(Some(serde_json::from_slice(&bytes)?))
  }

  fn persist(&self, record: &FormRecord) -> Result<()> {
    let bytes = serde_json::to_vec(record)?;
    self.store.set(&Namespace::Forms, &record.form_id, &bytes)
  }
}

impl Drop for FormManager {
  fn drop(&mut self) {
    self.stop();
  }
}
