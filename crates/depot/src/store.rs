//! Persistent document storage.
//!
//! The depot keeps every record (sandboxes, known checksums, cookbooks,
//! nodes, roles, clients) as a JSON document addressed by `(kind, key)`.
//! [`DocumentStore`] is the narrow interface the rest of the crate relies
//! on; [`SqliteStore`] persists to disk and [`MemoryStore`] backs tests.

use crate::error::{Error, Result};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Opaque key/value document store.
pub trait DocumentStore: Send + Sync {
    /// Keys of every document of a kind, sorted.
    fn list(&self, kind: &str) -> Result<Vec<String>>;

    /// Load one document. Fails with `NotFound` if absent.
    fn load(&self, kind: &str, key: &str) -> Result<Value>;

    /// Insert or replace one document.
    fn store(&self, kind: &str, key: &str, doc: &Value) -> Result<()>;

    /// Remove one document. Fails with `NotFound` if absent.
    fn delete(&self, kind: &str, key: &str) -> Result<()>;

    /// Every document of a kind, keyed.
    fn load_all(&self, kind: &str) -> Result<Vec<(String, Value)>> {
        self.list(kind)?
            .into_iter()
            .map(|key| {
                let doc = self.load(kind, &key)?;
                Ok((key, doc))
            })
            .collect()
    }
}

/// Typed helpers and view queries on top of any [`DocumentStore`].
pub trait DocumentStoreExt {
    /// Load and deserialize a document.
    fn load_as<T: DeserializeOwned>(&self, kind: &str, key: &str) -> Result<T>;

    /// Load a document, mapping `NotFound` to `None`.
    fn load_optional<T: DeserializeOwned>(&self, kind: &str, key: &str) -> Result<Option<T>>;

    /// Serialize and store a document.
    fn store_as<T: Serialize>(&self, kind: &str, key: &str, doc: &T) -> Result<()>;

    /// Whether a document exists.
    fn exists(&self, kind: &str, key: &str) -> Result<bool>;

    /// Map every document of a kind to zero or one `(key, value)` rows and
    /// group the rows by key.
    fn view<K, V, F>(&self, kind: &str, map: F) -> Result<BTreeMap<K, Vec<V>>>
    where
        K: Ord,
        F: FnMut(&str, &Value) -> Option<(K, V)>;
}

impl<S: DocumentStore + ?Sized> DocumentStoreExt for S {
    fn load_as<T: DeserializeOwned>(&self, kind: &str, key: &str) -> Result<T> {
        Ok(serde_json::from_value(self.load(kind, key)?)?)
    }

    fn load_optional<T: DeserializeOwned>(&self, kind: &str, key: &str) -> Result<Option<T>> {
        match self.load_as(kind, key) {
            Ok(doc) => Ok(Some(doc)),
            Err(Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn store_as<T: Serialize>(&self, kind: &str, key: &str, doc: &T) -> Result<()> {
        self.store(kind, key, &serde_json::to_value(doc)?)
    }

    fn exists(&self, kind: &str, key: &str) -> Result<bool> {
        match self.load(kind, key) {
            Ok(_) => Ok(true),
            Err(Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn view<K, V, F>(&self, kind: &str, mut map: F) -> Result<BTreeMap<K, Vec<V>>>
    where
        K: Ord,
        F: FnMut(&str, &Value) -> Option<(K, V)>,
    {
        let mut rows: BTreeMap<K, Vec<V>> = BTreeMap::new();
        for (key, doc) in self.load_all(kind)? {
            if let Some((k, v)) = map(&key, &doc) {
                rows.entry(k).or_default().push(v);
            }
        }
        Ok(rows)
    }
}

/// SQLite-backed document store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a document database at the given path
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        Self::init(Connection::open(db_path)?)
    }

    /// A private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS documents (
                kind TEXT NOT NULL,
                key TEXT NOT NULL,
                body TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (kind, key)
            );
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DocumentStore for SqliteStore {
    fn list(&self, kind: &str) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT key FROM documents WHERE kind = ?1 ORDER BY key")?;
        let keys = stmt
            .query_map([kind], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(keys)
    }

    fn load(&self, kind: &str, key: &str) -> Result<Value> {
        let body: Option<String> = self
            .conn()
            .query_row(
                "SELECT body FROM documents WHERE kind = ?1 AND key = ?2",
                params![kind, key],
                |row| row.get(0),
            )
            .optional()?;

        match body {
            Some(body) => Ok(serde_json::from_str(&body)?),
            None => Err(Error::not_found(kind, key)),
        }
    }

    fn store(&self, kind: &str, key: &str, doc: &Value) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        self.conn().execute(
            "INSERT INTO documents (kind, key, body, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(kind, key) DO UPDATE SET
                body = excluded.body,
                updated_at = excluded.updated_at",
            params![kind, key, doc.to_string(), now],
        )?;
        Ok(())
    }

    fn delete(&self, kind: &str, key: &str) -> Result<()> {
        let removed = self.conn().execute(
            "DELETE FROM documents WHERE kind = ?1 AND key = ?2",
            params![kind, key],
        )?;
        if removed == 0 {
            return Err(Error::not_found(kind, key));
        }
        Ok(())
    }
}

/// In-memory document store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: Mutex<BTreeMap<(String, String), Value>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn docs(&self) -> MutexGuard<'_, BTreeMap<(String, String), Value>> {
        self.docs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DocumentStore for MemoryStore {
    fn list(&self, kind: &str) -> Result<Vec<String>> {
        Ok(self
            .docs()
            .keys()
            .filter(|(k, _)| k == kind)
            .map(|(_, key)| key.clone())
            .collect())
    }

    fn load(&self, kind: &str, key: &str) -> Result<Value> {
        self.docs()
            .get(&(kind.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| Error::not_found(kind, key))
    }

    fn store(&self, kind: &str, key: &str, doc: &Value) -> Result<()> {
        self.docs()
            .insert((kind.to_string(), key.to_string()), doc.clone());
        Ok(())
    }

    fn delete(&self, kind: &str, key: &str) -> Result<()> {
        self.docs()
            .remove(&(kind.to_string(), key.to_string()))
            .map(|_| ())
            .ok_or_else(|| Error::not_found(kind, key))
    }
}
