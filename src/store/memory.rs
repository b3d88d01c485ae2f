//! In-process stores. The session tier always lives here.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

use super::{KeyValueStore, ObjectStore};
use crate::error::StoreError;

/// Key-value store held in memory, optionally with a byte quota like
/// browser storage.
#[derive(Debug, Default)]
pub struct MemoryStore {
  entries: Mutex<HashMap<String, String>>,
  quota: Option<usize>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Reject writes once keys plus values would exceed `bytes`.
  pub fn with_quota(bytes: usize) -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
      quota: Some(bytes),
    }
  }
}

impl KeyValueStore for MemoryStore {
  fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
    Ok(self.entries.lock()?.get(key).cloned())
  }

  fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
    let mut entries = self.entries.lock()?;

    if let Some(limit) = self.quota {
      let used: usize = entries
        .iter()
        .filter(|(k, _)| k.as_str() != key)
        .map(|(k, v)| k.len() + v.len())
        .sum::<usize>()
        + key.len()
        + value.len();
      if used > limit {
        return Err(StoreError::QuotaExceeded { used, limit });
      }
    }

    entries.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<(), StoreError> {
    self.entries.lock()?.remove(key);
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>, StoreError> {
    Ok(self.entries.lock()?.keys().cloned().collect())
  }
}

/// Object store held in memory.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
  objects: Mutex<HashMap<String, Value>>,
}

impl MemoryObjectStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl ObjectStore for MemoryObjectStore {
  fn put(&self, id: &str, value: &Value) -> Result<(), StoreError> {
    self
      .objects
      .lock()?
      .insert(id.to_string(), value.clone());
    Ok(())
  }

  fn get(&self, id: &str) -> Result<Option<Value>, StoreError> {
    Ok(self.objects.lock()?.get(id).cloned())
  }

  fn delete(&self, id: &str) -> Result<(), StoreError> {
    self.objects.lock()?.remove(id);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_quota_counts_replacement_once() {
    let store = MemoryStore::with_quota(10);
    store.set("a", "12345").unwrap();
    // Replacing the same key does not double count the old value
    store.set("a", "123456789").unwrap();
    assert!(matches!(
      store.set("b", "123456789"),
      Err(StoreError::QuotaExceeded { .. })
    ));
    assert_eq!(store.get("a").unwrap().as_deref(), Some("123456789"));
  }
}
