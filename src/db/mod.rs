//! SQLite-backed storage.
//!
//! One [`Database`] owns the connection and implements every capability
//! trait in [`crate::capabilities`]. Each logical change runs in its own
//! SQLite transaction; the connection mutex serializes writers within the
//! process and `busy_timeout` bounds waits on other processes.

mod history;
mod memberships;
mod offsets;
mod outbox;
mod schedule;
mod schema;
mod segments;

use crate::config::DatabaseConfig;
use crate::error::{CohortError, Result};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct Database {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("path", &self.path).finish()
    }
}

impl Database {
    pub fn open(path: impl AsRef<Path>, config: &DatabaseConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;
        conn.busy_timeout(config.busy_timeout())?;
        schema::migrate(&conn, true)?;
        debug!(path = %path.display(), "database opened");

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path),
        })
    }

    /// Private in-memory database, for tests and tooling.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::migrate(&conn, false)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// Mutation failures surface as a single pre-commit error class.
fn transaction_error(e: rusqlite::Error) -> CohortError {
    CohortError::Transaction(e.to_string())
}
