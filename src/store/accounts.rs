//! Account rows, the single-active invariant, and account-scoped relays.

use rusqlite::{params, OptionalExtension};

use crate::types::{PublicKey, RelayPurpose, Timestamp};

use super::models::{Account, AccountMetadata, Relay};
use super::{Store, StoreError};

const ACCOUNT_COLS: &str =
    "pubkey, metadata, settings, onboarding, last_used, last_synced, active";

impl Store {
    pub fn insert_account(&self, pubkey: &PublicKey) -> Result<Account, StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO accounts (pubkey, last_used) VALUES (?1, ?2)",
                params![pubkey.as_hex(), Timestamp::now().as_secs()],
            )?;
            let account = conn.query_row(
                &format!("SELECT {ACCOUNT_COLS} FROM accounts WHERE pubkey = ?1"),
                [pubkey.as_hex()],
                |row| Ok(Account::from_row(row)),
            )??;
            Ok(account)
        })
    }

    pub fn get_account(&self, pubkey: &PublicKey) -> Result<Option<Account>, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {ACCOUNT_COLS} FROM accounts WHERE pubkey = ?1"),
                [pubkey.as_hex()],
                |row| Ok(Account::from_row(row)),
            )
            .optional()?
            .transpose()
        })
    }

    pub fn list_accounts(&self) -> Result<Vec<Account>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ACCOUNT_COLS} FROM accounts ORDER BY last_used DESC"
            ))?;
            let rows = stmt.query_map([], |row| Ok(Account::from_row(row)))?;
            rows.map(|r| r?).collect()
        })
    }

    pub fn active_account(&self) -> Result<Option<Account>, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {ACCOUNT_COLS} FROM accounts WHERE active = 1"),
                [],
                |row| Ok(Account::from_row(row)),
            )
            .optional()?
            .transpose()
        })
    }

    /// Clear-then-set in one transaction so the partial unique index on
    /// `active = 1` can never be violated mid-switch.
    pub fn set_active_account(&self, pubkey: &PublicKey) -> Result<Account, StoreError> {
        self.with_tx(|tx| {
            tx.execute("UPDATE accounts SET active = 0 WHERE active = 1", [])?;
            let changed = tx.execute(
                "UPDATE accounts SET active = 1, last_used = ?2 WHERE pubkey = ?1",
                params![pubkey.as_hex(), Timestamp::now().as_secs()],
            )?;
            if changed == 0 {
                return Err(StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows));
            }
            let account = tx.query_row(
                &format!("SELECT {ACCOUNT_COLS} FROM accounts WHERE pubkey = ?1"),
                [pubkey.as_hex()],
                |row| Ok(Account::from_row(row)),
            )??;
            Ok(account)
        })
    }

    pub fn clear_active_account(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute("UPDATE accounts SET active = 0 WHERE active = 1", [])?;
            Ok(())
        })
    }

    pub fn update_account_metadata(
        &self,
        pubkey: &PublicKey,
        metadata: &AccountMetadata,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(metadata)?;
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE accounts SET metadata = ?2, last_synced = ?3 WHERE pubkey = ?1",
                params![pubkey.as_hex(), json, Timestamp::now().as_secs()],
            )?;
            Ok(())
        })
    }

    /// Cascades into relays, groups, invites, and messages. Ledger rows for
    /// the account are removed explicitly; they carry no FK.
    pub fn delete_account(&self, pubkey: &PublicKey) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            tx.execute(
                "DELETE FROM accounts WHERE pubkey = ?1",
                [pubkey.as_hex()],
            )?;
            tx.execute(
                "DELETE FROM processed_invites WHERE account_pubkey = ?1",
                [pubkey.as_hex()],
            )?;
            tx.execute(
                "DELETE FROM processed_messages WHERE account_pubkey = ?1",
                [pubkey.as_hex()],
            )?;
            Ok(())
        })
    }

    pub fn store_account_secret(
        &self,
        pubkey: &PublicKey,
        secret_hex: &str,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO account_secrets (pubkey, secret) VALUES (?1, ?2)
                 ON CONFLICT (pubkey) DO UPDATE SET secret = excluded.secret",
                params![pubkey.as_hex(), secret_hex],
            )?;
            Ok(())
        })
    }

    pub fn account_secret(&self, pubkey: &PublicKey) -> Result<Option<String>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT secret FROM account_secrets WHERE pubkey = ?1",
                    [pubkey.as_hex()],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    pub fn save_engine_state(
        &self,
        pubkey: &PublicKey,
        state: &[u8],
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO engine_state (account_pubkey, state, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (account_pubkey) DO UPDATE
                 SET state = excluded.state, updated_at = excluded.updated_at",
                params![pubkey.as_hex(), state, Timestamp::now().as_secs()],
            )?;
            Ok(())
        })
    }

    pub fn engine_state(&self, pubkey: &PublicKey) -> Result<Option<Vec<u8>>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT state FROM engine_state WHERE account_pubkey = ?1",
                    [pubkey.as_hex()],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    pub fn replace_account_relays(
        &self,
        pubkey: &PublicKey,
        relays: &[Relay],
    ) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            tx.execute(
                "DELETE FROM account_relays WHERE account_pubkey = ?1",
                [pubkey.as_hex()],
            )?;
            for relay in relays {
                tx.execute(
                    "INSERT INTO account_relays (url, purpose, account_pubkey)
                     VALUES (?1, ?2, ?3)",
                    params![relay.url, relay.purpose.as_str(), pubkey.as_hex()],
                )?;
            }
            Ok(())
        })
    }

    pub fn account_relays(&self, pubkey: &PublicKey) -> Result<Vec<Relay>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT url, purpose FROM account_relays
                 WHERE account_pubkey = ?1 ORDER BY url",
            )?;
            let rows = stmt.query_map([pubkey.as_hex()], |row| {
                let url: String = row.get(0)?;
                let purpose: String = row.get(1)?;
                Ok((url, purpose))
            })?;
            rows.map(|r| {
                let (url, purpose) = r?;
                Ok(Relay {
                    url,
                    purpose: RelayPurpose::parse(&purpose)
                        .map_err(|_| StoreError::CorruptRow(format!("bad purpose: {purpose}")))?,
                })
            })
            .collect()
        })
    }
}
