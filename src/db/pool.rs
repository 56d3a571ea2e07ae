//! A small round-robin pool of `rusqlite::Connection`s.
//!
//! Grounded on `mrkline-backpak`'s `Cache::new`, which opens one connection,
//! sets `PRAGMA journal_mode=wal`, and asserts the result. This generalizes
//! that to N connections sharing one database file, each configured the same
//! way, handed out round-robin under a mutex per slot.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use rusqlite::Connection;

use crate::error::DbError;

/// A fixed-size pool of connections to one SQLite database file.
pub struct ConnectionPool {
    slots: Vec<Mutex<Connection>>,
    next: AtomicUsize,
}

impl ConnectionPool {
    /// Opens `size` connections to `path`, each in WAL mode with
    /// `synchronous=NORMAL`.
    pub fn open(path: &Path, size: usize) -> Result<Self, DbError> {
        assert!(size > 0, "connection pool size must be positive");
        let mut slots = Vec::with_capacity(size);
        for _ in 0..size {
            let conn = Connection::open(path)?;
            conn.pragma_update(None, "journal_mode", "wal")?;
            conn.pragma_update(None, "synchronous", "normal")?;
            conn.pragma_update(None, "foreign_keys", "on")?;
            slots.push(Mutex::new(conn));
        }
        Ok(Self {
            slots,
            next: AtomicUsize::new(0),
        })
    }

    /// Borrows the next connection in round-robin order.
    ///
    /// Blocks if that slot's connection is currently in use by another
    /// caller; with a pool sized to the expected concurrency this is rare.
    pub fn get(&self) -> parking_lot::MutexGuard<'_, Connection> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        self.slots[index].lock()
    }

    /// Number of pooled connections.
    #[must_use]
    pub fn size(&self) -> usize {
        self.slots.len()
    }
}
