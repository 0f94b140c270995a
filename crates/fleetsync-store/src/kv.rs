//! Key-value persistence.
//!
//! The engine reads and writes operator settings and warm-start snapshots
//! through [`KeyValueStore`]. Two implementations ship here:
//!
//! - [`SqliteKvStore`]: a single-table SQLite database.
//! - [`MemoryKvStore`]: a map behind a mutex, for tests and ephemeral runs.
//!
//! # Storage layout
//!
//! | column     | type | description                               |
//! |------------|------|-------------------------------------------|
//! | key        | TEXT | primary key                               |
//! | value      | TEXT | JSON text                                 |
//! | updated_at | TEXT | RFC-3339 time of the last write (UTC)     |
//!
//! Values written by older clients are not always JSON (a bare `MANUAL`, for
//! instance). Such text is returned as a JSON string rather than rejected,
//! so that settings migration can decide what to make of it.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;
use fleetsync_types::FleetError;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum KvError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl From<KvError> for FleetError {
    fn from(e: KvError) -> Self {
        FleetError::Storage(e.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Trait
// ─────────────────────────────────────────────────────────────────────────────

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, KvError>;

    fn put(&self, key: &str, value: &Value) -> Result<(), KvError>;

    /// Returns `false` when the key was absent.
    fn remove(&self, key: &str) -> Result<bool, KvError>;

    /// Keys starting with `prefix`, sorted.
    fn keys(&self, prefix: &str) -> Result<Vec<String>, KvError>;
}

fn decode(text: String) -> Value {
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}

// ─────────────────────────────────────────────────────────────────────────────
// SqliteKvStore
// ─────────────────────────────────────────────────────────────────────────────

pub struct SqliteKvStore {
    conn: Mutex<Connection>,
}

impl SqliteKvStore {
    /// Open (or create) a database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, KvError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, KvError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), KvError> {
        self.conn.lock().execute_batch(
            "CREATE TABLE IF NOT EXISTS fleet_settings (
                key        TEXT NOT NULL PRIMARY KEY,
                value      TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )?;
        Ok(())
    }
}

impl KeyValueStore for SqliteKvStore {
    fn get(&self, key: &str) -> Result<Option<Value>, KvError> {
        let conn = self.conn.lock();
        let text: Option<String> = conn
            .query_row(
                "SELECT value FROM fleet_settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(text.map(decode))
    }

    fn put(&self, key: &str, value: &Value) -> Result<(), KvError> {
        let text = serde_json::to_string(value)?;
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO fleet_settings (key, value, updated_at)
             VALUES (?1, ?2, ?3)",
            params![key, text, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, KvError> {
        let n = self
            .conn
            .lock()
            .execute("DELETE FROM fleet_settings WHERE key = ?1", params![key])?;
        Ok(n > 0)
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT key FROM fleet_settings ORDER BY key ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut keys = Vec::new();
        for key in rows {
            let key = key?;
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MemoryKvStore
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<BTreeMap<String, Value>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-filled with `entries`, e.g. a legacy settings layout.
    pub fn with_entries<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Self {
            entries: Mutex::new(entries.into_iter().map(|(k, v)| (k.into(), v)).collect()),
        }
    }
}

impl KeyValueStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<Value>, KvError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn put(&self, key: &str, value: &Value) -> Result<(), KvError> {
        self.entries.lock().insert(key.to_string(), value.clone());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, KvError> {
        Ok(self.entries.lock().remove(key).is_some())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        Ok(self
            .entries
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn exercise(store: &dyn KeyValueStore) {
        assert_eq!(store.get("thresholds").unwrap(), None);
        store.put("thresholds", &json!({"temperature": {"min": 18}})).unwrap();
        store.put("systemMode", &json!("MANUAL")).unwrap();
        store.put("snapshot/dev-1", &json!({})).unwrap();

        assert_eq!(
            store.get("thresholds").unwrap(),
            Some(json!({"temperature": {"min": 18}}))
        );
        assert_eq!(store.keys("snapshot/").unwrap(), vec!["snapshot/dev-1"]);
        assert_eq!(store.keys("").unwrap().len(), 3);

        store.put("systemMode", &json!("AUTOMATIC")).unwrap();
        assert_eq!(store.get("systemMode").unwrap(), Some(json!("AUTOMATIC")));

        assert!(store.remove("systemMode").unwrap());
        assert!(!store.remove("systemMode").unwrap());
    }

    #[test]
    fn memory_store_contract() {
        exercise(&MemoryKvStore::new());
    }

    #[test]
    fn sqlite_store_contract() {
        exercise(&SqliteKvStore::open_in_memory().unwrap());
    }

    #[test]
    fn sqlite_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.db");
        {
            let store = SqliteKvStore::open(&path).unwrap();
            store.put("selectedDevice", &json!("dev-2")).unwrap();
        }
        let store = SqliteKvStore::open(&path).unwrap();
        assert_eq!(store.get("selectedDevice").unwrap(), Some(json!("dev-2")));
    }

    #[test]
    fn non_json_text_is_returned_as_string() {
        let store = SqliteKvStore::open_in_memory().unwrap();
        store
            .conn
            .lock()
            .execute(
                "INSERT INTO fleet_settings (key, value, updated_at) VALUES ('systemMode', 'auto', '')",
                [],
            )
            .unwrap();
        assert_eq!(store.get("systemMode").unwrap(), Some(json!("auto")));
    }
}
