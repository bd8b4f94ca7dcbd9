//! The "SQL storage" collaborator interface from the design, realized
//! concretely with `rusqlite`. A single [`SqlConn`] wraps one
//! `rusqlite::Connection` behind a mutex: the engine treats the SQL driver
//! as serializing (per the concurrency model), so a plain mutex is the
//! direct expression of that requirement rather than a connection pool.

use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;

pub struct SqlConn {
    inner: Mutex<Connection>,
}

impl SqlConn {
    /// # Errors
    /// Returns an error if the connection cannot be opened or pragmas fail.
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self { inner: Mutex::new(conn) })
    }

    /// # Errors
    /// Returns an error if the in-memory connection cannot be opened.
    pub fn open_in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self { inner: Mutex::new(conn) })
    }

    /// Runs `f` with exclusive access to the underlying connection. Every SQL
    /// operation in the engine funnels through this single entry point.
    pub fn with<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> rusqlite::Result<T> {
        let guard = self.inner.lock();
        f(&guard)
    }

    pub fn with_mut<T>(&self, f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>) -> rusqlite::Result<T> {
        let mut guard = self.inner.lock();
        f(&mut guard)
    }
}
