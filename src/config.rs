use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::client::ClientConfig;
use crate::cache::DEFAULT_PREFIX;
use crate::poller::PollerConfig;
use crate::store::SqliteStorage;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub poller: PollerSettings,
  #[serde(default)]
  pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Backend root, e.g. `https://market.example.com/api`
  pub base_url: String,
  #[serde(default = "default_request_timeout")]
  pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub max_age_secs: u64,
  /// Namespace for cache keys in the session store
  pub key_prefix: String,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      max_age_secs: 3600,
      key_prefix: DEFAULT_PREFIX.to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollerSettings {
  pub interval_secs: u64,
  pub max_backoff_cycles: u32,
}

impl Default for PollerSettings {
  fn default() -> Self {
    Self {
      interval_secs: 30,
      max_backoff_cycles: 8,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// SQLite database path (defaults to the data directory)
  pub path: Option<PathBuf>,
}

fn default_request_timeout() -> u64 {
  10
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./vmsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/vmsync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/vmsync/config.yaml\n\
                 with at least `api.base_url` set."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("vmsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("vmsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.api.base_url.trim().is_empty() {
      return Err(eyre!("api.base_url must not be empty"));
    }
    Ok(config)
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.api.request_timeout_secs)
  }

  pub fn client_config(&self) -> ClientConfig {
    ClientConfig {
      request_timeout: self.request_timeout(),
      ..ClientConfig::default()
    }
  }

  pub fn cache_max_age(&self) -> chrono::Duration {
    let secs = i64::try_from(self.cache.max_age_secs).unwrap_or(i64::MAX);
    chrono::Duration::seconds(secs.min(i64::MAX / 1000))
  }

  pub fn poller_config(&self) -> PollerConfig {
    PollerConfig {
      interval: Duration::from_secs(self.poller.interval_secs.max(1)),
      probe_timeout: self.request_timeout(),
      max_backoff_cycles: self.poller.max_backoff_cycles,
    }
  }

  pub fn storage_path(&self) -> Result<PathBuf> {
    match &self.storage.path {
      Some(p) => Ok(p.clone()),
      None => SqliteStorage::default_path(),
    }
  }

  /// Directory holding the database and the log file.
  pub fn data_dir(&self) -> Result<PathBuf> {
    let db = self.storage_path()?;
    Ok(
      db.parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(".")),
    )
  }

  /// Get the API token from the environment.
  ///
  /// Checks VMSYNC_TOKEN.
  pub fn get_api_token() -> Result<String> {
    std::env::var("VMSYNC_TOKEN")
      .map_err(|_| eyre!("API token not found. Pass --token or set VMSYNC_TOKEN."))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::parse("api:\n  base_url: https://market.test/api\n").unwrap();

    assert_eq!(config.api.request_timeout_secs, 10);
    assert_eq!(config.cache.max_age_secs, 3600);
    assert_eq!(config.cache.key_prefix, "vm_cache:");
    assert_eq!(config.poller.interval_secs, 30);
    assert_eq!(config.poller.max_backoff_cycles, 8);
    assert!(config.storage.path.is_none());
    assert_eq!(config.cache_max_age(), chrono::Duration::hours(1));
  }

  #[test]
  fn test_full_config() {
    let yaml = r#"
api:
  base_url: http://localhost:8000
  request_timeout_secs: 3
cache:
  max_age_secs: 60
  key_prefix: "test_cache:"
poller:
  interval_secs: 5
  max_backoff_cycles: 4
storage:
  path: /tmp/vmsync-test/store.db
"#;
    let config = Config::parse(yaml).unwrap();

    assert_eq!(config.client_config().request_timeout, Duration::from_secs(3));
    let poller = config.poller_config();
    assert_eq!(poller.interval, Duration::from_secs(5));
    assert_eq!(poller.probe_timeout, Duration::from_secs(3));
    assert_eq!(poller.max_backoff_cycles, 4);
    assert_eq!(config.data_dir().unwrap(), PathBuf::from("/tmp/vmsync-test"));
  }

  #[test]
  fn test_base_url_required() {
    assert!(Config::parse("cache:\n  max_age_secs: 10\n").is_err());
    assert!(Config::parse("api:\n  base_url: \"  \"\n").is_err());
  }

  #[test]
  fn test_missing_explicit_path() {
    let err = Config::load(Some(Path::new("/nonexistent/vmsync.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }

  #[test]
  fn test_load_from_file() {
    let dir = std::env::temp_dir().join(format!("vmsync-config-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("config.yaml");
    std::fs::write(&path, "api:\n  base_url: https://market.test\n").unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.api.base_url, "https://market.test");

    std::fs::remove_dir_all(&dir).unwrap();
  }
}
