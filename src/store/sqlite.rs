//! SQLite-backed durable store.

use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Result, SyncError};

use super::{KeyValueStore, Namespace};

/// Schema for the key/value table. Writes are durable across process
/// restarts; each (namespace, key) pair is an independent row.
const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    namespace TEXT NOT NULL,
    key TEXT NOT NULL,
    value BLOB NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (namespace, key)
);

CREATE INDEX IF NOT EXISTS idx_kv_store_namespace ON kv_store(namespace);
"#;

/// Durable key/value store on SQLite.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open or create the store at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open or create the store at an explicit path.
  pub fn open_at(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        SyncError::StorageUnavailable(format!("failed to create store directory: {}", e))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      SyncError::StorageUnavailable(format!(
        "failed to open store at {}: {}",
        path.display(),
        e
      ))
    })?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// Get the default database path.
  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| {
        SyncError::StorageUnavailable("could not determine data directory".to_string())
      })?;

    Ok(data_dir.join("offramp").join("store.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| SyncError::StorageUnavailable(format!("failed to run migrations: {}", e)))?;
    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| SyncError::StorageUnavailable(format!("lock poisoned: {}", e)))
  }
}

impl KeyValueStore for SqliteStore {
  fn get(&self, namespace: &Namespace, key: &str) -> Result<Option<Vec<u8>>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT value FROM kv_store WHERE namespace = ? AND key = ?")
      .map_err(|e| SyncError::StorageUnavailable(format!("failed to prepare query: {}", e)))?;

    let value: Option<Vec<u8>> = stmt
      .query_row(params![namespace.as_str(), key], |row| row.get(0))
      .ok();

    Ok(value)
  }

  fn set(&self, namespace: &Namespace, key: &str, value: &[u8]) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute(
        "INSERT OR REPLACE INTO kv_store (namespace, key, value, updated_at)
         VALUES (?, ?, ?, datetime('now'))",
        params![namespace.as_str(), key, value],
      )
      .map_err(|e| SyncError::StorageUnavailable(format!("failed to store value: {}", e)))?;

    Ok(())
  }

  fn remove(&self, namespace: &Namespace, key: &str) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute(
        "DELETE FROM kv_store WHERE namespace = ? AND key = ?",
        params![namespace.as_str(), key],
      )
      .map_err(|e| SyncError::StorageUnavailable(format!("failed to remove value: {}", e)))?;

    Ok(())
  }

  fn list_keys(&self, namespace: &Namespace) -> Result<Vec<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT key FROM kv_store WHERE namespace = ? ORDER BY key")
      .map_err(|e| SyncError::StorageUnavailable(format!("failed to prepare query: {}", e)))?;

    let keys = stmt
      .query_map(params![namespace.as_str()], |row| row.get(0))
      .map_err(|e| SyncError::StorageUnavailable(format!("failed to list keys: {}", e)))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(keys)
  }

  fn list_namespaces(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT DISTINCT namespace FROM kv_store ORDER BY namespace")
      .map_err(|e| SyncError::StorageUnavailable(format!("failed to prepare query: {}", e)))?;

    let namespaces = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| SyncError::StorageUnavailable(format!("failed to list namespaces: {}", e)))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(namespaces)
  }

  fn clear_namespace(&self, namespace: &str) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute("DELETE FROM kv_store WHERE namespace = ?", params![namespace])
      .map_err(|e| SyncError::StorageUnavailable(format!("failed to clear namespace: {}", e)))?;

    Ok(())
  }
}
