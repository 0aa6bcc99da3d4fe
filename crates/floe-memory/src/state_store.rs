use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use floe_core::error::{FloeError, Result};
use floe_core::traits::StateStore;

/// Process-local [`StateStore`]; contents are lost on exit.
#[derive(Default)]
pub struct InMemoryStateStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StateStore for InMemoryStateStore {
    fn save(&self, key: &str, value: Vec<u8>) -> BoxFuture<'_, Result<()>> {
        let key = key.to_string();
        Box::pin(async move {
            self.entries
                .lock()
                .map_err(|e| FloeError::Store(e.to_string()))?
                .insert(key, value);
            Ok(())
        })
    }

    fn load(&self, key: &str) -> BoxFuture<'_, Result<Option<Vec<u8>>>> {
        let key = key.to_string();
        Box::pin(async move {
            let entries = self.entries.lock().map_err(|e| FloeError::Store(e.to_string()))?;
            Ok(entries.get(&key).cloned())
        })
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, Result<()>> {
        let key = key.to_string();
        Box::pin(async move {
            self.entries
                .lock()
                .map_err(|e| FloeError::Store(e.to_string()))?
                .remove(&key);
            Ok(())
        })
    }
}

/// SQLite-backed [`StateStore`] for memory sessions and paused runs.
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS state (
        key TEXT PRIMARY KEY,
        value BLOB NOT NULL,
        updated_at TEXT NOT NULL
    );";

impl SqliteStateStore {
    /// Open or create the state database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| FloeError::Database(format!("Failed to create state directory: {}", e)))?;
        }

        let conn = Connection::open(path).map_err(|e| FloeError::Database(e.to_string()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| FloeError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| FloeError::Database(format!("Failed to initialize state schema: {}", e)))?;

        debug!(path = %path.display(), "State store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| FloeError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| FloeError::Database(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl StateStore for SqliteStateStore {
    fn save(&self, key: &str, value: Vec<u8>) -> BoxFuture<'_, Result<()>> {
        let key = key.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().map_err(|e| FloeError::Database(e.to_string()))?;
            conn.execute(
                "INSERT INTO state (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, Utc::now().to_rfc3339()],
            )
            .map_err(|e| FloeError::Database(format!("Failed to save state: {}", e)))?;
            Ok(())
        })
    }

    fn load(&self, key: &str) -> BoxFuture<'_, Result<Option<Vec<u8>>>> {
        let key = key.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().map_err(|e| FloeError::Database(e.to_string()))?;
            conn.query_row("SELECT value FROM state WHERE key = ?1", params![key], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()
            .map_err(|e| FloeError::Database(format!("Failed to load state: {}", e)))
        })
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, Result<()>> {
        let key = key.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().map_err(|e| FloeError::Database(e.to_string()))?;
            conn.execute("DELETE FROM state WHERE key = ?1", params![key])
                .map_err(|e| FloeError::Database(e.to_string()))?;
            Ok(())
        })
    }
}
