//! SQLite storage service shared by the credential store, device directory
//! and broker registry.
//!
//! A single connection behind a mutex is sufficient here: every store
//! operation is a short indexed statement or a small transaction, and the
//! authorization hot path performs exactly one indexed lookup per store.

use rusqlite::Connection;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::info;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS devices (
    device_id TEXT PRIMARY KEY,
    pod_code TEXT,
    vendor TEXT NOT NULL DEFAULT '',
    topic_template TEXT,
    legacy_pod_topics INTEGER NOT NULL DEFAULT 0,
    is_active INTEGER NOT NULL DEFAULT 1,
    last_seen INTEGER
);

CREATE TABLE IF NOT EXISTS credentials (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id TEXT NOT NULL REFERENCES devices(device_id),
    username TEXT NOT NULL,
    secret_hash BLOB NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    issued_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_credentials_one_active
    ON credentials(device_id) WHERE is_active = 1;
CREATE INDEX IF NOT EXISTS idx_credentials_username
    ON credentials(username, is_active);

CREATE TABLE IF NOT EXISTS brokers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    host TEXT NOT NULL,
    port INTEGER NOT NULL,
    username TEXT,
    password TEXT,
    use_tls INTEGER NOT NULL DEFAULT 0,
    is_active INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// Handle to the gateway database. Cheap to clone; all clones share one
/// connection.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Open (creating if needed) the database at `path` and ensure the schema
    /// exists.
    pub fn open(path: &str) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        info!(path, "gateway database ready");
        Ok(db)
    }

    /// In-memory database, used by tests and the doc examples.
    pub fn open_in_memory() -> Result<Self, rusqlite::Error> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<(), rusqlite::Error> {
        self.lock().execute_batch(SCHEMA)
    }

    /// Acquire the connection. A poisoned lock is recovered rather than
    /// propagated: SQLite leaves no half-applied statement behind a panic,
    /// and the stores keep no state outside the database.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
