//! Shared connection handle used by the engine and its workers.
//!
//! # Invariants
//! - Exactly one thread holds the connection at a time.
//! - Callers must not hold the guard across model calls or thread joins.
//! - A poisoned mutex is recovered: SQLite transactions that were open in a
//!   panicking thread roll back when their guard drops.

use super::{open_db, open_db_in_memory, DbResult};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Cloneable handle over one migrated SQLite connection.
#[derive(Clone)]
pub struct SharedDb {
    conn: Arc<Mutex<Connection>>,
}

impl SharedDb {
    /// Wraps an already migrated connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Opens (and migrates) a database file.
    pub fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        open_db(path).map(Self::new)
    }

    /// Opens (and migrates) a private in-memory database.
    pub fn open_in_memory() -> DbResult<Self> {
        open_db_in_memory().map(Self::new)
    }

    /// Locks the connection for the duration of the returned guard.
    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
