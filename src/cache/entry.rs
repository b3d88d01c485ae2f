//! Cache entry and fetch-result types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A cached value with its write time and optional validator (ETag).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
  pub key: String,
  pub value: Value,
  pub written_at: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub validator: Option<String>,
}

/// Result of a fetch, including where the data came from.
#[derive(Debug, Clone)]
pub struct Fetched<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from a cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> Fetched<T> {
  /// Fresh data from the network.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  pub fn from_cache(data: T, source: CacheSource, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source,
      cached_at,
    }
  }

  /// Network unavailable, serving the newest copy we have.
  pub fn offline(data: T, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at,
    }
  }

  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Fetched<U> {
    Fetched {
      data: f(self.data),
      source: self.source,
      cached_at: self.cached_at,
    }
  }
}

/// Indicates where fetched data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Long-lived local record, returned without touching the network
  LocalStore,
  /// TTL cache hit
  Cache,
  /// Server answered 304, cached value returned unchanged
  NotModified,
  /// Offline mode - network unavailable, serving cached data
  Offline,
}
