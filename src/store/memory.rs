//! In-memory store used for degraded operation and tests.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{Result, SyncError};

use super::{KeyValueStore, Namespace};

/// Volatile store with the same contract as the durable backends, minus
/// durability. Used as the `FallbackStore` overlay and in tests.
pub struct MemoryStore {
  entries: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
    }
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<(String, String), Vec<u8>>>> {
    self
      .entries
      .lock()
      .map_err(|e| SyncError::StorageUnavailable(format!("lock poisoned: {}", e)))
  }
}

impl Default for MemoryStore {
  fn default() -> Self {
    Self::new()
  }
}

impl KeyValueStore for MemoryStore {
  fn get(&self, namespace: &Namespace, key: &str) -> Result<Option<Vec<u8>>> {
    let entries = self.lock()?;
    Ok(entries.get(&(namespace.as_str(), key.to_string())).cloned())
  }

  fn set(&self, namespace: &Namespace, key: &str, value: &[u8]) -> Result<()> {
    let mut entries = self.lock()?;
    entries.insert((namespace.as_str(), key.to_string()), value.to_vec());
    Ok(())
  }

  fn remove(&self, namespace: &Namespace, key: &str) -> Result<()> {
    let mut entries = self.lock()?;
    entries.remove(&(namespace.as_str(), key.to_string()));
    Ok(())
  }

  fn list_keys(&self, namespace: &Namespace) -> Result<Vec<String>> {
    let entries = self.lock()?;
    let ns = namespace.as_str();
    let mut keys: Vec<String> = entries
      .keys()
      .filter(|(n, _)| *n == ns)
      .map(|(_, k)| k.clone())
      .collect();
    keys.sort();
    Ok(keys)
  }

  fn list_namespaces(&self) -> Result<Vec<String>> {
    let entries = self.lock()?;
    let mut namespaces: Vec<String> = entries.keys().map(|(n, _)| n.clone()).collect();
    namespaces.sort();
    namespaces.dedup();
    Ok(namespaces)
  }

  fn clear_namespace(&self, namespace: &str) -> Result<()> {
    let mut entries = self.lock()?;
    entries.retain(|(n, _), _| n != namespace);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_basic_operations() {
    let store = MemoryStore::new();

    assert_eq!(store.get(&Namespace::Meta, "a").unwrap(), None);

    store.set(&Namespace::Meta, "a", b"1").unwrap();
    store.set(&Namespace::Meta, "b", b"2").unwrap();
    store.set(&Namespace::Cache, "a", b"3").unwrap();

    assert_eq!(store.get(&Namespace::Meta, "a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(store.list_keys(&Namespace::Meta).unwrap(), vec!["a", "b"]);
    assert_eq!(
      store.list_namespaces().unwrap(),
      vec!["cache".to_string(), "meta".to_string()]
    );
  }

  #[test]
  fn test_clear_namespace_only_touches_target() {
    let store = MemoryStore::new();
    store
      .set(&Namespace::Assets("v1".to_string()), "app.js", b"x")
      .unwrap();
    store
      .set(&Namespace::Assets("v2".to_string()), "app.js", b"y")
      .unwrap();

    store.clear_namespace("assets:v1").unwrap();

    assert_eq!(
      store
        .get(&Namespace::Assets("v1".to_string()), "app.js")
        .unwrap(),
      None
    );
    assert_eq!(
      store
        .get(&Namespace::Assets("v2".to_string()), "app.js")
        .unwrap(),
      Some(b"y".to_vec())
    );
  }
}
