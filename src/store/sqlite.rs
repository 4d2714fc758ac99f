//! `SQLite` medium
//!
//! Keeps the snapshot in a single-row table. The upsert is one statement, so
//! the `SQLite` journal provides the atomic replace.

use super::{StateMedium, StoreResult};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS session_snapshot (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    body BLOB NOT NULL,
    saved_at TEXT NOT NULL
);
";

/// Thread-safe `SQLite` handle holding the session snapshot
#[derive(Clone)]
pub struct SqliteMedium {
    conn: Arc<Mutex<Connection>>,
    label: String,
}

impl SqliteMedium {
    /// Open or create the database at the given path
    ///
    /// # Errors
    ///
    /// `Sqlite` when the database cannot be opened or the schema created.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let label = path.as_ref().display().to_string();
        let conn = Connection::open(path)?;
        Self::init(conn, label)
    }

    /// Open an in-memory database (for testing)
    ///
    /// # Errors
    ///
    /// `Sqlite` when the schema cannot be created.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, ":memory:".to_string())
    }

    fn init(conn: Connection, label: String) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            label,
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StateMedium for SqliteMedium {
    fn load(&self) -> StoreResult<Option<Vec<u8>>> {
        let body = self
            .conn()
            .query_row("SELECT body FROM session_snapshot WHERE id = 1", [], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()?;
        Ok(body)
    }

    fn save(&self, bytes: &[u8]) -> StoreResult<()> {
        self.conn().execute(
            "INSERT INTO session_snapshot (id, body, saved_at) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET body = excluded.body, saved_at = excluded.saved_at",
            params![bytes, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("sqlite:{}", self.label)
    }
}
