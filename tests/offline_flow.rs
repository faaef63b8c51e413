//! End-to-end offline/reconnect scenarios against the assembled engine.

use futures::future::BoxFuture;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use offramp::{
  GatewayResponse, HttpRequest, HttpResponse, KeyValueStore, MemoryStore, Method, Priority,
  Prober, RequestOptions, Result, SyncConfig, SyncEngine, SyncError, Transport,
};

/// Prober whose outcome tests flip to simulate connectivity changes.
struct FakeProber {
  reachable: AtomicBool,
}

impl FakeProber {
  fn new(reachable: bool) -> Arc<Self> {
    Arc::new(Self {
      reachable: AtomicBool::new(reachable),
    })
  }
}

impl Prober for FakeProber {
  fn probe(&self) -> BoxFuture<'_, bool> {
    let result = self.reachable.load(Ordering::SeqCst);
    Box::pin(async move { result })
  }
}

/// Transport recording every dispatched request, failing on demand.
struct FakeTransport {
  sent: Mutex<Vec<(Method, String)>>,
  fail: AtomicBool,
}

impl FakeTransport {
  fn new() -> Arc<Self> {
    Arc::new(Self {
      sent: Mutex::new(Vec::new()),
      fail: AtomicBool::new(false),
    })
  }

  fn sent(&self) -> Vec<(Method, String)> {
    self.sent.lock().unwrap().clone()
  }
}

impl Transport for FakeTransport {
  fn send<'a>(
    &'a self,
    request: &'a HttpRequest,
    timeout: Duration,
  ) -> BoxFuture<'a, Result<HttpResponse>> {
    self
      .sent
      .lock()
      .unwrap()
      .push((request.method, request.url.clone()));
    let fail = self.fail.load(Ordering::SeqCst);
    Box::pin(async move {
      if fail {
        Err(SyncError::NetworkTimeout(timeout))
      } else {
        Ok(HttpResponse {
          status: 200,
          headers: Vec::new(),
          body: b"{\"ok\":true}".to_vec(),
        })
      }
    })
  }
}

struct Harness {
  engine: SyncEngine,
  transport: Arc<FakeTransport>,
  prober: Arc<FakeProber>,
}

fn harness(online: bool) -> Harness {
  let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
  let transport = FakeTransport::new();
  let prober = FakeProber::new(online);

  let config = SyncConfig {
    max_replay_attempts: 3,
    ..SyncConfig::default()
  };
  let engine = SyncEngine::with_parts(config, store, transport.clone(), prober.clone()).unwrap();

  Harness {
    engine,
    transport,
    prober,
  }
}

async fn go_offline(h: &Harness) {
  h.prober.reachable.store(false, Ordering::SeqCst);
  h.engine.monitor().force_probe().await;
}

async fn go_online(h: &Harness) {
  h.prober.reachable.store(true, Ordering::SeqCst);
  h.engine.monitor().force_probe().await;
}

#[tokio::test]
async fn offline_read_is_served_from_cache_populated_while_online() {
  let h = harness(true);
  go_online(&h).await;

  // Warm the cache while online.
  let fetched = h
    .engine
    .gateway()
    .request(RequestOptions::get("/api/deals").with_cache_key("deals"))
    .await
    .unwrap();
  assert!(matches!(fetched, GatewayResponse::Fetched(_)));

  go_offline(&h).await;
  let calls_before = h.transport.sent().len();

  let cached = h
    .engine
    .gateway()
    .request(RequestOptions::get("/api/deals").with_cache_key("deals"))
    .await
    .unwrap();

  match cached {
    GatewayResponse::Cached { body, .. } => assert_eq!(body, b"{\"ok\":true}"),
    other => panic!("expected cached read, got {:?}", other),
  }
  assert_eq!(h.transport.sent().len(), calls_before);
}

#[tokio::test]
async fn offline_write_queues_and_reconnect_drains_automatically() {
  let h = harness(false);
  h.engine.start();
  go_offline(&h).await;

  let response = h
    .engine
    .gateway()
    .request(
      RequestOptions::new(Method::Post, "/api/orders").with_body(b"{\"qty\":1}".to_vec()),
    )
    .await
    .unwrap();
  assert!(response.is_queued());

  let pending = h.engine.queue().peek_all().unwrap();
  assert_eq!(pending.len(), 1);
  assert_eq!(pending[0].priority, Priority::Normal);
  assert_eq!(pending[0].attempts, 0);
  assert!(h.transport.sent().is_empty());

  // Connectivity returns; the monitor's event drives the drain.
  go_online(&h).await;
  tokio::time::sleep(Duration::from_millis(50)).await;

  assert!(h.engine.queue().peek_all().unwrap().is_empty());
  let sent = h.transport.sent();
  assert_eq!(sent, vec![(Method::Post, "/api/orders".to_string())]);

  h.engine.shutdown();
}

#[tokio::test]
async fn replay_failures_dead_letter_after_max_attempts() {
  let h = harness(false);
  go_offline(&h).await;

  let queued = h
    .engine
    .gateway()
    .request(RequestOptions::new(Method::Post, "/api/orders"))
    .await
    .unwrap();
  let GatewayResponse::Queued { id } = queued else {
    panic!("expected queued write");
  };

  // Network "returns" but every replay attempt fails.
  h.prober.reachable.store(true, Ordering::SeqCst);
  h.engine.monitor().force_probe().await;
  h.transport.fail.store(true, Ordering::SeqCst);

  for expected_attempts in 1..=2u32 {
    let report = h.engine.queue().drain().await.unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(h.engine.queue().peek_all().unwrap()[0].attempts, expected_attempts);
  }

  let report = h.engine.queue().drain().await.unwrap();
  assert_eq!(report.dead_lettered.len(), 1);
  assert!(matches!(
    &report.dead_lettered[0],
    SyncError::QueueExhausted { id: dead_id, attempts } if *dead_id == id && *attempts == 3
  ));

  // Not retried again.
  let calls = h.transport.sent().len();
  h.engine.queue().drain().await.unwrap();
  assert_eq!(h.transport.sent().len(), calls);

  let dead = h.engine.queue().dead_letters().unwrap();
  assert_eq!(dead.len(), 1);
  assert_eq!(dead[0].attempts, 3);
  assert_eq!(dead[0].id, id);
}

#[tokio::test]
async fn offline_form_save_syncs_automatically_on_reconnect() {
  let h = harness(false);
  h.engine.start();
  go_offline(&h).await;

  let forms = h.engine.forms();
  forms.set_sync_endpoint("profile", "/api/forms/profile");
  forms
    .save_form_state("profile", json!({"name": "Dana"}))
    .await
    .unwrap();

  let record = forms.record("profile").unwrap().unwrap();
  assert!(record.offline_sync_pending);
  assert!(record.last_saved.is_some());
  assert!(record.last_synced_to_server.is_none());

  go_online(&h).await;
  tokio::time::sleep(Duration::from_millis(50)).await;

  let record = forms.record("profile").unwrap().unwrap();
  assert!(!record.offline_sync_pending);
  assert!(record.last_synced_to_server.is_some());
  assert!(h
    .transport
    .sent()
    .contains(&(Method::Post, "/api/forms/profile".to_string())));

  h.engine.shutdown();
}

#[tokio::test]
async fn queued_writes_replay_in_priority_order() {
  let h = harness(false);
  go_offline(&h).await;

  let gateway = h.engine.gateway();
  for (url, priority) in [
    ("/api/low", Priority::Low),
    ("/api/high-1", Priority::High),
    ("/api/normal", Priority::Normal),
    ("/api/high-2", Priority::High),
  ] {
    gateway
      .request(RequestOptions::new(Method::Post, url).with_priority(priority))
      .await
      .unwrap();
  }

  go_online(&h).await;
  let report = h.engine.queue().drain().await.unwrap();
  assert_eq!(report.succeeded.len(), 4);

  let urls: Vec<String> = h.transport.sent().into_iter().map(|(_, url)| url).collect();
  assert_eq!(urls, vec!["/api/high-1", "/api/high-2", "/api/normal", "/api/low"]);
}
