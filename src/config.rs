//! Configuration for the synchronization layer.
//!
//! The configuration is a closed struct: unrecognized fields in the YAML file
//! are rejected at load time rather than silently ignored.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SyncError};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
  /// Liveness endpoint the Connectivity Monitor probes (HEAD, short timeout).
  pub liveness_url: String,

  /// Client-side probe timeout in seconds.
  #[serde(default = "default_probe_timeout_secs")]
  pub probe_timeout_secs: u64,

  /// Re-probe interval while offline, in seconds.
  #[serde(default = "default_offline_probe_interval_secs")]
  pub offline_probe_interval_secs: u64,

  /// Timeout for data requests issued by the gateway and replay queue.
  #[serde(default = "default_request_timeout_secs")]
  pub request_timeout_secs: u64,

  /// Default TTL for cached read responses, in seconds.
  #[serde(default = "default_cache_ttl_secs")]
  pub default_cache_ttl_secs: u64,

  /// Replay attempts before a queued request is dead-lettered.
  #[serde(default = "default_max_replay_attempts")]
  pub max_replay_attempts: u32,

  /// Interval for form auto-save, in seconds.
  #[serde(default = "default_autosave_interval_secs")]
  pub autosave_interval_secs: u64,

  /// Reserved API path prefix. The Background Proxy Agent never caches
  /// requests under this prefix; the gateway's cache policy governs them.
  #[serde(default = "default_api_prefix")]
  pub api_prefix: String,

  #[serde(default)]
  pub agent: AgentConfig,

  /// Override for the durable store directory (defaults to the platform
  /// data directory).
  pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
  /// Versioned name of the asset cache, e.g. "assets-v3". Bumping the
  /// version and activating the agent garbage-collects older caches.
  #[serde(default = "default_cache_version")]
  pub cache_version: String,

  /// Static asset URLs pre-populated into the cache on install.
  #[serde(default)]
  pub asset_manifest: Vec<String>,
}

impl Default for AgentConfig {
  fn default() -> Self {
    Self {
      cache_version: default_cache_version(),
      asset_manifest: Vec::new(),
    }
  }
}

fn default_probe_timeout_secs() -> u64 {
  4
}
fn default_offline_probe_interval_secs() -> u64 {
  30
}
fn default_request_timeout_secs() -> u64 {
  10
}
fn default_cache_ttl_secs() -> u64 {
  300
}
fn default_max_replay_attempts() -> u32 {
  3
}
fn default_autosave_interval_secs() -> u64 {
  30
}
fn default_api_prefix() -> String {
  "/api/".to_string()
}
fn default_cache_version() -> String {
  "assets-v1".to_string()
}

impl SyncConfig {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offramp.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offramp/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(SyncError::Config(format!(
          "config file not found: {}",
          p.display()
        )));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(SyncError::Config(
        "no configuration file found; create one at ~/.config/offramp/config.yaml \
         (see config.example.yaml for the format)"
          .to_string(),
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("offramp.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offramp").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
      SyncError::Config(format!("failed to read config file {}: {}", path.display(), e))
    })?;

    let config: SyncConfig = serde_yaml::from_str(&contents).map_err(|e| {
      SyncError::Config(format!("failed to parse config file {}: {}", path.display(), e))
    })?;

    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.liveness_url.is_empty() {
      return Err(SyncError::Config("liveness_url must not be empty".to_string()));
    }
    if self.max_replay_attempts == 0 {
      return Err(SyncError::Config(
        "max_replay_attempts must be at least 1".to_string(),
      ));
    }
    Ok(())
  }

  pub fn probe_timeout(&self) -> Duration {
    Duration::from_secs(self.probe_timeout_secs)
  }

  pub fn offline_probe_interval(&self) -> Duration {
    Duration::from_secs(self.offline_probe_interval_secs)
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs)
  }

  pub fn autosave_interval(&self) -> Duration {
    Duration::from_secs(self.autosave_interval_secs)
  }
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      liveness_url: "http://localhost:8080/health".to_string(),
      probe_timeout_secs: default_probe_timeout_secs(),
      offline_probe_interval_secs: default_offline_probe_interval_secs(),
      request_timeout_secs: default_request_timeout_secs(),
      default_cache_ttl_secs: default_cache_ttl_secs(),
      max_replay_attempts: default_max_replay_attempts(),
      autosave_interval_secs: default_autosave_interval_secs(),
      api_prefix: default_api_prefix(),
      agent: AgentConfig::default(),
      data_dir: None,
    }
  }
}
