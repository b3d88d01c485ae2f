//! Durable Store Adapter.
//!
//! Uniform read/write over the three local persistence surfaces:
//! - a short-lived key-value store (per process session)
//! - a long-lived key-value store (survives restarts)
//! - a single-table object store keyed by unique id (last-resort hydration)
//!
//! Persistence failures never reach callers. They are logged and the
//! operation degrades to a miss (reads) or a no-op (writes), since the
//! in-memory cache tier stays functional for the session.

mod memory;
mod sqlite;

pub use memory::{MemoryObjectStore, MemoryStore};
pub use sqlite::{SqliteKeyValueStore, SqliteObjectStore, SqliteStorage};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

use crate::error::StoreError;

/// A string key-value store.
pub trait KeyValueStore: Send + Sync {
  fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

  fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

  fn remove(&self, key: &str) -> Result<(), StoreError>;

  /// All keys currently stored, in no particular order.
  fn keys(&self) -> Result<Vec<String>, StoreError>;
}

/// A single-table object store keyed by unique id.
pub trait ObjectStore: Send + Sync {
  fn put(&self, id: &str, value: &Value) -> Result<(), StoreError>;

  fn get(&self, id: &str) -> Result<Option<Value>, StoreError>;

  fn delete(&self, id: &str) -> Result<(), StoreError>;
}

/// Which key-value store an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
  /// Cleared when the session ends
  Session,
  /// Survives restarts
  Local,
}

/// The three stores behind one failure-swallowing facade.
#[derive(Clone)]
pub struct DurableStores {
  session: Arc<dyn KeyValueStore>,
  local: Arc<dyn KeyValueStore>,
  objects: Arc<dyn ObjectStore>,
}

impl DurableStores {
  pub fn new(
    session: Arc<dyn KeyValueStore>,
    local: Arc<dyn KeyValueStore>,
    objects: Arc<dyn ObjectStore>,
  ) -> Self {
    Self {
      session,
      local,
      objects,
    }
  }

  /// Stores backed entirely by process memory.
  pub fn in_memory() -> Self {
    Self::new(
      Arc::new(MemoryStore::new()),
      Arc::new(MemoryStore::new()),
      Arc::new(MemoryObjectStore::new()),
    )
  }

  /// In-memory session store over SQLite-backed local and object stores.
  pub fn with_sqlite(storage: &SqliteStorage) -> Self {
    Self::new(
      Arc::new(MemoryStore::new()),
      Arc::new(storage.key_value("local")),
      Arc::new(storage.objects()),
    )
  }

  fn tier(&self, tier: Tier) -> &dyn KeyValueStore {
    match tier {
      Tier::Session => self.session.as_ref(),
      Tier::Local => self.local.as_ref(),
    }
  }

  pub fn read_raw(&self, tier: Tier, key: &str) -> Option<String> {
    match self.tier(tier).get(key) {
      Ok(value) => value,
      Err(e) => {
        warn!(?tier, key, error = %e, "durable read failed");
        None
      }
    }
  }

  pub fn write_raw(&self, tier: Tier, key: &str, value: &str) -> bool {
    match self.tier(tier).set(key, value) {
      Ok(()) => true,
      Err(e) => {
        warn!(?tier, key, error = %e, "durable write failed, keeping in-memory copy only");
        false
      }
    }
  }

  /// Read and deserialize a JSON value. Corrupt entries read as absent.
  pub fn read<T: DeserializeOwned>(&self, tier: Tier, key: &str) -> Option<T> {
    let raw = self.read_raw(tier, key)?;
    match serde_json::from_str(&raw) {
      Ok(value) => Some(value),
      Err(e) => {
        warn!(?tier, key, error = %e, "discarding unreadable durable entry");
        None
      }
    }
  }

  pub fn write<T: Serialize>(&self, tier: Tier, key: &str, value: &T) -> bool {
    match serde_json::to_string(value) {
      Ok(raw) => self.write_raw(tier, key, &raw),
      Err(e) => {
        warn!(?tier, key, error = %e, "failed to serialize durable entry");
        false
      }
    }
  }

  pub fn remove(&self, tier: Tier, key: &str) {
    if let Err(e) = self.tier(tier).remove(key) {
      warn!(?tier, key, error = %e, "durable remove failed");
    }
  }

  pub fn keys_with_prefix(&self, tier: Tier, prefix: &str) -> Vec<String> {
    match self.tier(tier).keys() {
      Ok(keys) => keys.into_iter().filter(|k| k.starts_with(prefix)).collect(),
      Err(e) => {
        warn!(?tier, prefix, error = %e, "durable key scan failed");
        Vec::new()
      }
    }
  }

  pub fn read_object(&self, id: &str) -> Option<Value> {
    match self.objects.get(id) {
      Ok(value) => value,
      Err(e) => {
        warn!(id, error = %e, "object store read failed");
        None
      }
    }
  }

  pub fn write_object(&self, id: &str, value: &Value) {
    if let Err(e) = self.objects.put(id, value) {
      warn!(id, error = %e, "object store write failed");
    }
  }

  pub fn remove_object(&self, id: &str) {
    if let Err(e) = self.objects.delete(id) {
      warn!(id, error = %e, "object store delete failed");
    }
  }
}
