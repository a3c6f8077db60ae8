//! Message rows, the processed-messages ledger, and full-text search.
//!
//! Dedup is dual-layer: the ledger is keyed by the wrapping 445 event id,
//! the message row by the inner rumor id. A retransmission under a fresh
//! wrapper gets a new ledger row but no second transcript entry.

use rusqlite::{params, OptionalExtension};

use crate::types::{EventId, GroupId, PublicKey, Timestamp};

use super::models::{FailureRecord, Message, NewMessage, ProcessedMessage, ProcessedState};
use super::{Store, StoreError};

const MESSAGE_COLS: &str = "event_id, account_pubkey, mls_group_id, author_pubkey, \
     created_at, content, tags, event, outer_event_id";

impl Store {
    /// Upsert the message, refresh the group's last-message columns, and
    /// write the success ledger row, all in one transaction.
    pub fn record_message(&self, new: &NewMessage) -> Result<(), StoreError> {
        let message = &new.message;
        let tags = serde_json::to_string(&message.tags)?;
        let event = serde_json::to_string(&message.event)?;
        self.with_tx(|tx| {
            // Re-delivery of a known inner id under a different wrapper is
            // a transcript no-op.
            tx.execute(
                "INSERT OR IGNORE INTO messages (event_id, account_pubkey, mls_group_id,
                     author_pubkey, created_at, content, tags, event, outer_event_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    message.event_id.as_hex(),
                    message.account_pubkey.as_hex(),
                    message.mls_group_id.as_hex(),
                    message.author_pubkey.as_hex(),
                    message.created_at.as_secs(),
                    message.content,
                    tags,
                    event,
                    message.outer_event_id.as_ref().map(|id| id.as_hex().to_owned()),
                ],
            )?;
            tx.execute(
                "UPDATE groups SET last_message_id = ?3, last_message_at = ?4
                 WHERE mls_group_id = ?1 AND account_pubkey = ?2
                   AND (last_message_at IS NULL OR last_message_at <= ?4)",
                params![
                    message.mls_group_id.as_hex(),
                    message.account_pubkey.as_hex(),
                    message.event_id.as_hex(),
                    message.created_at.as_secs(),
                ],
            )?;
            tx.execute(
                "INSERT OR IGNORE INTO processed_messages
                     (event_id, account_pubkey, message_event_id, processed_at, state)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    new.wrapper_id.as_hex(),
                    message.account_pubkey.as_hex(),
                    message.event_id.as_hex(),
                    Timestamp::now().as_secs(),
                    ProcessedState::Processed.as_str(),
                ],
            )?;
            Ok(())
        })
    }

    /// Roll back a locally recorded send whose publish never landed: the
    /// transcript row, its ledger row, and the group's last-message columns
    /// when they point at it.
    pub fn forget_unpublished_message(
        &self,
        message_id: &EventId,
        wrapper_id: &EventId,
        account: &PublicKey,
    ) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            tx.execute(
                "UPDATE groups SET
                     last_message_id = (
                         SELECT event_id FROM messages
                         WHERE mls_group_id = groups.mls_group_id
                           AND account_pubkey = ?2 AND event_id != ?1
                         ORDER BY created_at DESC, event_id DESC LIMIT 1),
                     last_message_at = (
                         SELECT created_at FROM messages
                         WHERE mls_group_id = groups.mls_group_id
                           AND account_pubkey = ?2 AND event_id != ?1
                         ORDER BY created_at DESC, event_id DESC LIMIT 1)
                 WHERE account_pubkey = ?2 AND last_message_id = ?1",
                params![message_id.as_hex(), account.as_hex()],
            )?;
            tx.execute(
                "DELETE FROM messages WHERE event_id = ?1 AND account_pubkey = ?2",
                params![message_id.as_hex(), account.as_hex()],
            )?;
            tx.execute(
                "DELETE FROM processed_messages WHERE event_id = ?1 AND account_pubkey = ?2",
                params![wrapper_id.as_hex(), account.as_hex()],
            )?;
            Ok(())
        })
    }

    /// Ledger-only record for a wrapping event whose processing failed
    /// (unknown group, inactive group, decryption failure).
    pub fn record_message_failure(&self, failure: &FailureRecord) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO processed_messages
                     (event_id, account_pubkey, processed_at, state, failure_reason)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    failure.wrapper_id.as_hex(),
                    failure.account_pubkey.as_hex(),
                    Timestamp::now().as_secs(),
                    ProcessedState::Failed.as_str(),
                    failure.reason,
                ],
            )?;
            Ok(())
        })
    }

    /// Ledger row for a wrapping event that applied a commit rather than
    /// yielding a transcript message.
    pub fn record_message_commit(
        &self,
        wrapper_id: &EventId,
        account: &PublicKey,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO processed_messages
                     (event_id, account_pubkey, processed_at, state)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    wrapper_id.as_hex(),
                    account.as_hex(),
                    Timestamp::now().as_secs(),
                    ProcessedState::Processed.as_str(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn processed_message(
        &self,
        wrapper_id: &EventId,
        account: &PublicKey,
    ) -> Result<Option<ProcessedMessage>, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT event_id, account_pubkey, message_event_id, processed_at,
                        state, failure_reason
                 FROM processed_messages
                 WHERE event_id = ?1 AND account_pubkey = ?2",
                params![wrapper_id.as_hex(), account.as_hex()],
                |row| Ok(ProcessedMessage::from_row(row)),
            )
            .optional()?
            .transpose()
        })
    }

    pub fn get_message(
        &self,
        event_id: &EventId,
        account: &PublicKey,
    ) -> Result<Option<Message>, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {MESSAGE_COLS} FROM messages
                     WHERE event_id = ?1 AND account_pubkey = ?2"
                ),
                params![event_id.as_hex(), account.as_hex()],
                |row| Ok(Message::from_row(row)),
            )
            .optional()?
            .transpose()
        })
    }

    /// Transcript for one group, ordered by creation time (sort-on-read;
    /// arrival order is irrelevant).
    pub fn list_messages(
        &self,
        group_id: &GroupId,
        account: &PublicKey,
    ) -> Result<Vec<Message>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLS} FROM messages
                 WHERE mls_group_id = ?1 AND account_pubkey = ?2
                 ORDER BY created_at, event_id"
            ))?;
            let rows = stmt.query_map(params![group_id.as_hex(), account.as_hex()], |row| {
                Ok(Message::from_row(row))
            })?;
            rows.map(|r| r?).collect()
        })
    }

    /// Full-text search across the account's transcripts. The term is
    /// quoted so user input is matched literally rather than parsed as
    /// FTS5 query syntax.
    pub fn search_messages(
        &self,
        account: &PublicKey,
        term: &str,
    ) -> Result<Vec<Message>, StoreError> {
        let quoted = format!("\"{}\"", term.replace('"', "\"\""));
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLS} FROM messages
                 WHERE rowid IN (SELECT rowid FROM messages_fts WHERE messages_fts MATCH ?2)
                   AND account_pubkey = ?1
                 ORDER BY created_at DESC"
            ))?;
            let rows = stmt.query_map(params![account.as_hex(), quoted], |row| {
                Ok(Message::from_row(row))
            })?;
            rows.map(|r| r?).collect()
        })
    }
}
