//! Durable Local Store: persistent key/value storage with typed namespaces.
//!
//! Each namespace is owned by exactly one component (cache entries by the
//! gateway, queued requests by the replay queue, form snapshots by the form
//! manager). No two components write the same key, so the store needs no
//! cross-key transactions.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::sync::Arc;

use crate::error::Result;

/// Typed namespaces partitioning the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Namespace {
  /// Cached read responses, owned by the gateway.
  Cache,
  /// Pending queued requests, owned by the replay queue.
  Queue,
  /// Queued requests that exhausted their replay budget.
  DeadLetter,
  /// Form snapshots, owned by the form persistence manager.
  Forms,
  /// Small bookkeeping values (e.g. last-online timestamp).
  Meta,
  /// A versioned asset cache owned by the Background Proxy Agent.
  Assets(String),
}

impl Namespace {
  pub fn as_str(&self) -> String {
    match self {
      Namespace::Cache => "cache".to_string(),
      Namespace::Queue => "queue".to_string(),
      Namespace::DeadLetter => "dead_letter".to_string(),
      Namespace::Forms => "forms".to_string(),
      Namespace::Meta => "meta".to_string(),
      Namespace::Assets(version) => format!("assets:{}", version),
    }
  }

  /// Prefix shared by all versioned asset caches.
  pub const ASSETS_PREFIX: &'static str = "assets:";
}

/// Trait for durable key/value storage backends.
///
/// Guarantees: read-your-writes within a process; operations on distinct keys
/// are independent. `set` failures surface as `StorageUnavailable` and must be
/// treated as non-fatal by callers.
pub trait KeyValueStore: Send + Sync {
  fn get(&self, namespace: &Namespace, key: &str) -> Result<Option<Vec<u8>>>;

  fn set(&self, namespace: &Namespace, key: &str, value: &[u8]) -> Result<()>;

  fn remove(&self, namespace: &Namespace, key: &str) -> Result<()>;

  fn list_keys(&self, namespace: &Namespace) -> Result<Vec<String>>;

  /// All namespace names currently present, including versioned asset caches.
  fn list_namespaces(&self) -> Result<Vec<String>>;

  /// Delete every key in the named namespace.
  fn clear_namespace(&self, namespace: &str) -> Result<()>;
}

/// Durable-first store that degrades to an in-memory overlay when the
/// durable backend rejects a write.
///
/// A key written to the overlay is served from the overlay until a later
/// durable write for the same key succeeds, preserving read-your-writes for
/// the degraded operation.
pub struct FallbackStore {
  durable: Arc<dyn KeyValueStore>,
  overlay: MemoryStore,
}

impl FallbackStore {
  pub fn new(durable: Arc<dyn KeyValueStore>) -> Self {
    Self {
      durable,
      overlay: MemoryStore::new(),
    }
  }
}

impl KeyValueStore for FallbackStore {
  fn get(&self, namespace: &Namespace, key: &str) -> Result<Option<Vec<u8>>> {
    if let Some(value) = self.overlay.get(namespace, key)? {
      return Ok(Some(value));
    }
    self.durable.get(namespace, key)
  }

  fn set(&self, namespace: &Namespace, key: &str, value: &[u8]) -> Result<()> {
    match self.durable.set(namespace, key, value) {
      Ok(()) => {
        // Durable copy is now authoritative again.
        self.overlay.remove(namespace, key)?;
        Ok(())
      }
      Err(e) => {
        tracing::warn!(
          namespace = %namespace.as_str(),
          key,
          error = %e,
          "durable write failed, keeping value in memory only"
        );
        self.overlay.set(namespace, key, value)
      }
    }
  }

  fn remove(&self, namespace: &Namespace, key: &str) -> Result<()> {
    self.overlay.remove(namespace, key)?;
    self.durable.remove(namespace, key)
  }

  fn list_keys(&self, namespace: &Namespace) -> Result<Vec<String>> {
    let mut keys = self.durable.list_keys(namespace)?;
    for key in self.overlay.list_keys(namespace)? {
      if !keys.contains(&key) {
        keys.push(key);
      }
    }
    Ok(keys)
  }

  fn list_namespaces(&self) -> Result<Vec<String>> {
    let mut namespaces = self.durable.list_namespaces()?;
    for ns in self.overlay.list_namespaces()? {
      if !namespaces.contains(&ns) {
        namespaces.push(ns);
      }
    }
    Ok(namespaces)
  }

  fn clear_namespace(&self, namespace: &str) -> Result<()> {
    self.overlay.clear_namespace(namespace)?;
    self.durable.clear_namespace(namespace)
  }
}
