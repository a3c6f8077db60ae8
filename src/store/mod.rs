//! SQLite-backed persistent store.
//!
//! One database per data directory, opened in WAL mode with foreign keys
//! enforced. All entity writes that pair with an idempotency-ledger write
//! happen inside a single transaction so a crash can never leave a ledger
//! row without its entity or the reverse.

pub mod accounts;
pub mod groups;
pub mod invites;
pub mod messages;
pub mod migrations;
pub mod models;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, Transaction};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("store lock poisoned: {0}")]
    Lock(String),

    #[error("corrupt row: {0}")]
    CorruptRow(String),
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn, Some(path))
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, None)
    }

    fn init(conn: Connection, path: Option<&Path>) -> Result<Self, StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        migrations::run(&conn)?;

        if let Some(path) = path {
            info!("store opened at {}", path.display());
        }
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Lock(e.to_string()))?;
        f(&conn)
    }

    /// Run `f` inside a transaction; commit on `Ok`, roll back on `Err`.
    pub(crate) fn with_tx<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Lock(e.to_string()))?;
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Wipe every table. Used by the delete-all-data operation.
    pub fn wipe(&self) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            // accounts cascades into everything account-owned; the ledgers
            // have no FK on an entity so they are cleared explicitly.
            tx.execute("DELETE FROM accounts", [])?;
            tx.execute("DELETE FROM processed_invites", [])?;
            tx.execute("DELETE FROM processed_messages", [])?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PublicKey;

    #[test]
    fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("covey.db");
        let account = PublicKey::from_bytes(&[9u8; 32]);

        let store = Store::open(&path).unwrap();
        store.insert_account(&account).unwrap();
        drop(store);

        let store = Store::open(&path).unwrap();
        assert!(store.get_account(&account).unwrap().is_some());
    }

    #[test]
    fn migrations_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("covey.db");
        Store::open(&path).unwrap();
        Store::open(&path).unwrap();
    }
}
