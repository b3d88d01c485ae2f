//! In-memory TTL cache layered over the session store.

use chrono::Duration;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

use super::entry::CacheEntry;
use crate::clock::{Clock, SystemClock};
use crate::store::{DurableStores, Tier};

/// Key prefix for every entry this cache persists.
pub const DEFAULT_PREFIX: &str = "vm_cache:";

/// TTL cache that keeps an in-memory map and mirrors every write into the
/// session store.
///
/// The in-memory map is owned exclusively by this cache. The session copy
/// lets a fresh instance (e.g. after a reload) hydrate without the network.
pub struct TtlCache {
  prefix: String,
  /// Entries older than this are treated as absent
  max_age: Duration,
  entries: Mutex<HashMap<String, CacheEntry>>,
  stores: DurableStores,
  clock: Arc<dyn Clock>,
}

impl TtlCache {
  pub fn new(stores: DurableStores) -> Self {
    Self {
      prefix: DEFAULT_PREFIX.to_string(),
      max_age: Duration::hours(1),
      entries: Mutex::new(HashMap::new()),
      stores,
      clock: Arc::new(SystemClock),
    }
  }

  pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
    self.prefix = prefix.into();
    self
  }

  pub fn with_max_age(mut self, max_age: Duration) -> Self {
    self.max_age = max_age;
    self
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn max_age(&self) -> Duration {
    self.max_age
  }

  fn storage_key(&self, key: &str) -> String {
    format!("{}{}", self.prefix, key)
  }

  fn is_fresh(&self, entry: &CacheEntry) -> bool {
    self.clock.now() - entry.written_at <= self.max_age
  }

  /// Store `value` under `key`. The durable copy is best-effort.
  pub fn set(&self, key: &str, value: Value, validator: Option<String>) -> CacheEntry {
    let mut written_at = self.clock.now();
    if let Some((previous, _)) = self.freshest(key) {
      // Keep written_at strictly increasing per key
      if written_at <= previous.written_at {
        written_at = previous.written_at + Duration::milliseconds(1);
      }
    }

    let entry = CacheEntry {
      key: key.to_string(),
      value,
      written_at,
      validator,
    };

    self
      .entries
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(key.to_string(), entry.clone());
    self
      .stores
      .write(Tier::Session, &self.storage_key(key), &entry);

    entry
  }

  /// The entry for `key` if it is within `max_age`.
  ///
  /// When the session copy is fresher than the in-memory one (another
  /// instance wrote it), the session copy wins and replaces it in memory.
  pub fn get(&self, key: &str) -> Option<CacheEntry> {
    let (entry, from_durable) = match self.freshest(key) {
      Some(found) => found,
      None => {
        debug!(key, "cache miss");
        return None;
      }
    };

    if !self.is_fresh(&entry) {
      debug!(key, written_at = %entry.written_at, "cache entry expired");
      return None;
    }

    if from_durable {
      debug!(key, "hydrated cache entry from session store");
      self
        .entries
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(key.to_string(), entry.clone());
    }

    Some(entry)
  }

  /// The freshest entry for `key` regardless of age.
  pub fn peek(&self, key: &str) -> Option<CacheEntry> {
    self.freshest(key).map(|(entry, _)| entry)
  }

  /// Freshest of the in-memory and session copies, and whether the session
  /// copy won.
  fn freshest(&self, key: &str) -> Option<(CacheEntry, bool)> {
    let memory = self
      .entries
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .get(key)
      .cloned();
    let durable: Option<CacheEntry> = self.stores.read(Tier::Session, &self.storage_key(key));

    match (memory, durable) {
      (Some(m), Some(d)) if d.written_at > m.written_at => Some((d, true)),
      (Some(m), _) => Some((m, false)),
      (None, Some(d)) => Some((d, true)),
      (None, None) => None,
    }
  }

  pub fn clear(&self, key: &str) {
    self
      .entries
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .remove(key);
    self.stores.remove(Tier::Session, &self.storage_key(key));
  }

  /// Remove every entry under this cache's prefix. Keys written by anything
  /// else sharing the session store are left alone.
  pub fn clear_all(&self) {
    self
      .entries
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clear();

    for key in self.stores.keys_with_prefix(Tier::Session, &self.prefix) {
      self.stores.remove(Tier::Session, &key);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::store::{MemoryObjectStore, MemoryStore};
  use chrono::Utc;
  use serde_json::json;

  fn cache_with_clock(stores: &DurableStores) -> (TtlCache, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let cache = TtlCache::new(stores.clone()).with_clock(clock.clone());
    (cache, clock)
  }

  #[test]
  fn test_hit_until_max_age_then_miss() {
    let stores = DurableStores::in_memory();
    let (cache, clock) = cache_with_clock(&stores);

    cache.set("vehicle:1", json!({"id": "1"}), None);
    clock.advance(Duration::minutes(59));
    assert_eq!(cache.get("vehicle:1").unwrap().value, json!({"id": "1"}));

    clock.advance(Duration::minutes(1));
    assert!(cache.get("vehicle:1").is_some());

    clock.advance(Duration::milliseconds(1));
    assert!(cache.get("vehicle:1").is_none());
    // Still visible for validators and offline fallback
    assert!(cache.peek("vehicle:1").is_some());
  }

  #[test]
  fn test_written_at_strictly_increases() {
    let stores = DurableStores::in_memory();
    let (cache, _clock) = cache_with_clock(&stores);

    let first = cache.set("k", json!(1), None);
    let second = cache.set("k", json!(2), None);
    assert!(second.written_at > first.written_at);
  }

  #[test]
  fn test_hydrates_from_session_store() {
    let stores = DurableStores::in_memory();
    let (cache, clock) = cache_with_clock(&stores);
    cache.set("profile:me", json!({"username": "asha"}), Some("\"v1\"".into()));

    // A second instance sharing the stores, as after a reload
    let reloaded = TtlCache::new(stores.clone()).with_clock(clock.clone());
    let entry = reloaded.get("profile:me").unwrap();
    assert_eq!(entry.value["username"], "asha");
    assert_eq!(entry.validator.as_deref(), Some("\"v1\""));
  }

  #[test]
  fn test_fresher_durable_copy_wins() {
    let stores = DurableStores::in_memory();
    let (tab_a, clock) = cache_with_clock(&stores);
    let tab_b = TtlCache::new(stores.clone()).with_clock(clock.clone());

    tab_a.set("vehicle:3", json!({"v": "a"}), None);
    clock.advance(Duration::seconds(1));
    tab_b.set("vehicle:3", json!({"v": "b"}), None);

    assert_eq!(tab_a.get("vehicle:3").unwrap().value, json!({"v": "b"}));
  }

  #[test]
  fn test_clear_all_keeps_foreign_keys() {
    let stores = DurableStores::in_memory();
    let (cache, _clock) = cache_with_clock(&stores);

    stores.write_raw(Tier::Session, "session_user", "\"asha\"");
    cache.set("vehicle:1", json!(1), None);
    cache.set("vehicle:2", json!(2), None);

    cache.clear_all();

    assert!(cache.get("vehicle:1").is_none());
    assert!(cache.get("vehicle:2").is_none());
    assert!(stores
      .keys_with_prefix(Tier::Session, DEFAULT_PREFIX)
      .is_empty());
    assert_eq!(
      stores.read_raw(Tier::Session, "session_user").as_deref(),
      Some("\"asha\"")
    );
  }

  #[test]
  fn test_clear_single_key() {
    let stores = DurableStores::in_memory();
    let (cache, _clock) = cache_with_clock(&stores);
    cache.set("a", json!(1), None);
    cache.set("b", json!(2), None);

    cache.clear("a");
    assert!(cache.peek("a").is_none());
    assert!(cache.get("b").is_some());
  }

  #[test]
  fn test_durable_failure_keeps_memory_copy() {
    let stores = DurableStores::new(
      Arc::new(MemoryStore::with_quota(0)),
      Arc::new(MemoryStore::new()),
      Arc::new(MemoryObjectStore::new()),
    );
    let (cache, _clock) = cache_with_clock(&stores);

    cache.set("vehicle:9", json!({"id": "9"}), None);
    assert_eq!(cache.get("vehicle:9").unwrap().value, json!({"id": "9"}));
  }
}
