use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

pub const NODES: &str = "nodes";
pub const LOGS: &str = "logs";
pub const TEMPLATES: &str = "templates";
pub const SOURCES: &str = "sources";

/// Durable keyed record store. Records are JSON documents grouped into collections.
pub trait RecordStore: Send + Sync {
    fn get(&self, collection: &str, key: &str) -> Result<Option<Value>>;
    fn put(&self, collection: &str, key: &str, value: &Value) -> Result<()>;
    fn delete(&self, collection: &str, key: &str) -> Result<bool>;
    /// All records of a collection, ordered by key.
    fn list(&self, collection: &str) -> Result<Vec<(String, Value)>>;
    fn clear(&self, collection: &str) -> Result<()>;
}

/// Typed helpers over any [`RecordStore`].
pub trait RecordStoreExt {
    fn get_as<T: DeserializeOwned>(&self, collection: &str, key: &str) -> Result<Option<T>>;
    fn put_as<T: Serialize>(&self, collection: &str, key: &str, value: &T) -> Result<()>;
    fn list_as<T: DeserializeOwned>(&self, collection: &str) -> Result<Vec<T>>;
}

impl<S: RecordStore + ?Sized> RecordStoreExt for S {
    fn get_as<T: DeserializeOwned>(&self, collection: &str, key: &str) -> Result<Option<T>> {
        match self.get(collection, key)? {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    fn put_as<T: Serialize>(&self, collection: &str, key: &str, value: &T) -> Result<()> {
        self.put(collection, key, &serde_json::to_value(value)?)
    }

    fn list_as<T: DeserializeOwned>(&self, collection: &str) -> Result<Vec<T>> {
        self.list(collection)?
            .into_iter()
            .map(|(_, v)| serde_json::from_value(v).map_err(Into::into))
            .collect()
    }
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database file and its schema.
    pub fn open(path: &Path) -> Result<Self> {
        tracing::info!("SQLite database path: {:?}", path);
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("database lock poisoned"))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS records (
                collection TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (collection, key)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_records_collection ON records(collection)",
            [],
        )?;
        Ok(())
    }
}

impl RecordStore for SqliteStore {
    fn get(&self, collection: &str, key: &str) -> Result<Option<Value>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT value FROM records WHERE collection = ?1 AND key = ?2")?;
        let mut rows = stmt.query_map(params![collection, key], |row| row.get::<_, String>(0))?;
        match rows.next() {
            Some(row) => Ok(Some(serde_json::from_str(&row?)?)),
            None => Ok(None),
        }
    }

    fn put(&self, collection: &str, key: &str, value: &Value) -> Result<()> {
        let json = serde_json::to_string(value)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO records (collection, key, value, updated_at)
             VALUES (?1, ?2, ?3, CURRENT_TIMESTAMP)
             ON CONFLICT(collection, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at",
            params![collection, key, json],
        )?;
        Ok(())
    }

    fn delete(&self, collection: &str, key: &str) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn.execute(
            "DELETE FROM records WHERE collection = ?1 AND key = ?2",
            params![collection, key],
        )?;
        Ok(n > 0)
    }

    fn list(&self, collection: &str) -> Result<Vec<(String, Value)>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT key, value FROM records WHERE collection = ?1 ORDER BY key")?;
        let rows = stmt.query_map(params![collection], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (key, json) = row?;
            records.push((key, serde_json::from_str(&json)?));
        }
        Ok(records)
    }

    fn clear(&self, collection: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM records WHERE collection = ?1", params![collection])?;
        Ok(())
    }
}

/// Non-durable store for tests and embedding.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<(String, String), Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<(String, String), Value>>> {
        self.records.lock().map_err(|_| anyhow!("memory store lock poisoned"))
    }
}

impl RecordStore for MemoryStore {
    fn get(&self, collection: &str, key: &str) -> Result<Option<Value>> {
        Ok(self
            .lock()?
            .get(&(collection.to_string(), key.to_string()))
            .cloned())
    }

    fn put(&self, collection: &str, key: &str, value: &Value) -> Result<()> {
        self.lock()?
            .insert((collection.to_string(), key.to_string()), value.clone());
        Ok(())
    }

    fn delete(&self, collection: &str, key: &str) -> Result<bool> {
        Ok(self
            .lock()?
            .remove(&(collection.to_string(), key.to_string()))
            .is_some())
    }

    fn list(&self, collection: &str) -> Result<Vec<(String, Value)>> {
        Ok(self
            .lock()?
            .iter()
            .filter(|((c, _), _)| c == collection)
            .map(|((_, k), v)| (k.clone(), v.clone()))
            .collect())
    }

    fn clear(&self, collection: &str) -> Result<()> {
        self.lock()?.retain(|(c, _), _| c != collection);
        Ok(())
    }
}
