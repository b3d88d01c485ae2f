//! SQLite-backed long-lived stores.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::{KeyValueStore, ObjectStore};
use crate::error::StoreError;

/// Shared SQLite connection hosting the key-value and object tables.
#[derive(Clone)]
pub struct SqliteStorage {
  conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
  /// Open (or create) the database at `path`, or the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create storage directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open store database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// A private in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory store: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| eyre!("Failed to run store migrations: {}", e))?;

    Ok(Self {
      conn: Arc::new(Mutex::new(conn)),
    })
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("vmsync").join("store.db"))
  }

  /// A key-value view scoped to `namespace`.
  pub fn key_value(&self, namespace: &str) -> SqliteKeyValueStore {
    SqliteKeyValueStore {
      conn: Arc::clone(&self.conn),
      namespace: namespace.to_string(),
    }
  }

  pub fn objects(&self) -> SqliteObjectStore {
    SqliteObjectStore {
      conn: Arc::clone(&self.conn),
    }
  }
}

/// Schema for store tables.
const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    namespace TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (namespace, key)
);

CREATE TABLE IF NOT EXISTS object_store (
    id TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

pub struct SqliteKeyValueStore {
  conn: Arc<Mutex<Connection>>,
  namespace: String,
}

impl KeyValueStore for SqliteKeyValueStore {
  fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
    let conn = self.conn.lock()?;
    let value = conn
      .query_row(
        "SELECT value FROM kv_store WHERE namespace = ? AND key = ?",
        params![self.namespace, key],
        |row| row.get(0),
      )
      .optional()?;
    Ok(value)
  }

  fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
    let conn = self.conn.lock()?;
    conn.execute(
      "INSERT OR REPLACE INTO kv_store (namespace, key, value, updated_at)
       VALUES (?, ?, ?, datetime('now'))",
      params![self.namespace, key, value],
    )?;
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<(), StoreError> {
    let conn = self.conn.lock()?;
    conn.execute(
      "DELETE FROM kv_store WHERE namespace = ? AND key = ?",
      params![self.namespace, key],
    )?;
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>, StoreError> {
    let conn = self.conn.lock()?;
    let mut stmt = conn.prepare("SELECT key FROM kv_store WHERE namespace = ?")?;
    let keys = stmt
      .query_map(params![self.namespace], |row| row.get(0))?
      .collect::<Result<Vec<String>, _>>()?;
    Ok(keys)
  }
}

pub struct SqliteObjectStore {
  conn: Arc<Mutex<Connection>>,
}

impl ObjectStore for SqliteObjectStore {
  fn put(&self, id: &str, value: &Value) -> Result<(), StoreError> {
    let data = serde_json::to_vec(value)?;
    let conn = self.conn.lock()?;
    conn.execute(
      "INSERT OR REPLACE INTO object_store (id, data, stored_at)
       VALUES (?, ?, datetime('now'))",
      params![id, data],
    )?;
    Ok(())
  }

  fn get(&self, id: &str) -> Result<Option<Value>, StoreError> {
    let data: Option<Vec<u8>> = {
      let conn = self.conn.lock()?;
      conn
        .query_row(
          "SELECT data FROM object_store WHERE id = ?",
          params![id],
          |row| row.get(0),
        )
        .optional()?
    };

    match data {
      Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
      None => Ok(None),
    }
  }

  fn delete(&self, id: &str) -> Result<(), StoreError> {
    let conn = self.conn.lock()?;
    conn.execute("DELETE FROM object_store WHERE id = ?", params![id])?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_namespaces_do_not_overlap() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let local = storage.key_value("local");
    let other = storage.key_value("other");

    local.set("access_token", "abc").unwrap();
    assert_eq!(local.get("access_token").unwrap().as_deref(), Some("abc"));
    assert_eq!(other.get("access_token").unwrap(), None);
    assert!(other.keys().unwrap().is_empty());

    local.set("access_token", "def").unwrap();
    assert_eq!(local.keys().unwrap(), vec!["access_token".to_string()]);

    local.remove("access_token").unwrap();
    assert_eq!(local.get("access_token").unwrap(), None);
  }

  #[test]
  fn test_object_store_persists_json() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let objects = storage.objects();

    let value = json!({"id": "12", "vehicle": {"brand": "Maruti"}});
    objects.put("vehicle:12", &value).unwrap();
    assert_eq!(objects.get("vehicle:12").unwrap(), Some(value));

    objects.delete("vehicle:12").unwrap();
    assert_eq!(objects.get("vehicle:12").unwrap(), None);
  }

  #[test]
  fn test_reopen_keeps_data() {
    let dir = std::env::temp_dir().join(format!("vmsync-test-{}", std::process::id()));
    let path = dir.join("store.db");

    {
      let storage = SqliteStorage::open(Some(&path)).unwrap();
      storage.key_value("local").set("k", "v").unwrap();
    }

    let storage = SqliteStorage::open(Some(&path)).unwrap();
    assert_eq!(
      storage.key_value("local").get("k").unwrap().as_deref(),
      Some("v")
    );

    let _ = std::fs::remove_dir_all(&dir);
  }
}
