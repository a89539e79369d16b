// SQLite database setup and migrations
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::storage::StorageError;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Corrupt row in {table}: {message}")]
    CorruptRow { table: &'static str, message: String },
}

pub type DbResult<T> = Result<T, DbError>;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

// Thread-safe database connection wrapper
#[derive(Clone)]
pub struct DbConnection {
    conn: Arc<Mutex<Connection>>,
}

impl DbConnection {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Open (creating if needed) the database file and bring its schema up to date
    pub fn open(path: &Path) -> DbResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        run_migrations(&conn)?;

        Ok(Self::new(conn))
    }

    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        run_migrations(&conn)?;
        Ok(Self::new(conn))
    }

    /// A panic while holding the lock leaves the connection usable
    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn run_migrations(conn: &Connection) -> DbResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if current_version < 1 {
        log::info!("Applying database migration v1");
        migration_v1(conn)?;
        conn.execute("INSERT INTO schema_migrations (version) VALUES (?1)", [1])?;
    }

    Ok(())
}

fn migration_v1(conn: &Connection) -> DbResult<()> {
    // Collected audio samples; the WAV lives on disk
    conn.execute(
        "CREATE TABLE IF NOT EXISTS samples (
            id TEXT PRIMARY KEY,
            owner TEXT NOT NULL,
            label TEXT NOT NULL,
            path TEXT NOT NULL,
            sha256 TEXT NOT NULL,
            sample_rate INTEGER NOT NULL,
            num_samples INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            metadata_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_samples_owner_label ON samples(owner, label, created_at)",
        [],
    )?;

    // One row per published version; versions never reused
    conn.execute(
        "CREATE TABLE IF NOT EXISTS model_artifacts (
            id TEXT PRIMARY KEY,
            owner TEXT NOT NULL,
            class_scope TEXT NOT NULL,
            version INTEGER NOT NULL,
            path TEXT NOT NULL,
            metrics_path TEXT,
            sha256 TEXT NOT NULL,
            bytes INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            metrics_json TEXT NOT NULL,
            UNIQUE (owner, class_scope, version)
        )",
        [],
    )?;

    // Exactly one active version per (owner, class_scope); 0 is the baseline
    conn.execute(
        "CREATE TABLE IF NOT EXISTS active_models (
            owner TEXT NOT NULL,
            class_scope TEXT NOT NULL,
            version INTEGER NOT NULL,
            activated_at TEXT NOT NULL,
            PRIMARY KEY (owner, class_scope)
        )",
        [],
    )?;

    Ok(())
}
