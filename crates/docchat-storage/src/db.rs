//! SQLite handle shared by the repositories and the auth provider.
//!
//! One connection behind a Mutex. File databases run in WAL mode; both kinds
//! enforce foreign keys and are migrated on open.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::info;

use docchat_core::error::DocchatError;

use crate::migrations;

const FILE_PRAGMAS: &str = "PRAGMA journal_mode = WAL;
     PRAGMA synchronous = NORMAL;
     PRAGMA busy_timeout = 5000;
     PRAGMA foreign_keys = ON;";

const MEMORY_PRAGMAS: &str = "PRAGMA foreign_keys = ON;";

fn storage(context: &str, e: rusqlite::Error) -> DocchatError {
    DocchatError::Storage(format!("{}: {}", context, e))
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) `path`, creating its parent directory first.
    pub fn new(path: &Path) -> Result<Self, DocchatError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| storage("Failed to open database", e))?;
        let db = Self::prepare(conn, FILE_PRAGMAS)?;
        info!(path = %path.display(), "Database ready");
        Ok(db)
    }

    /// Private in-memory database, used by tests.
    pub fn in_memory() -> Result<Self, DocchatError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| storage("Failed to open in-memory database", e))?;
        Self::prepare(conn, MEMORY_PRAGMAS)
    }

    fn prepare(conn: Connection, pragmas: &str) -> Result<Self, DocchatError> {
        conn.execute_batch(pragmas)
            .map_err(|e| storage("Failed to set pragmas", e))?;
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` with the connection locked for its whole duration.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, DocchatError>
    where
        F: FnOnce(&Connection) -> Result<T, DocchatError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|_| DocchatError::Storage("Database lock poisoned".to_string()))?;
        f(&conn)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish()
    }
}
