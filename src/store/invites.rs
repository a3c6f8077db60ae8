//! Invite rows and the processed-invites idempotency ledger.
//!
//! The ledger is keyed by the wrapping transport event id and is
//! append-only; the invite row itself is keyed by the inner welcome rumor
//! id. Both writes share one transaction.

use rusqlite::{params, OptionalExtension};

use crate::types::{EventId, PublicKey, Timestamp};

use super::models::{
    FailureRecord, Invite, InviteState, NewInvite, ProcessedInvite, ProcessedState,
};
use super::{Store, StoreError};

const INVITE_COLS: &str = "event_id, account_pubkey, event, mls_group_id, nostr_group_id, \
     group_name, group_description, group_admin_pubkeys, group_relays, inviter, \
     member_count, state, outer_event_id";

impl Store {
    /// Insert the invite and its success ledger row atomically.
    pub fn record_invite(&self, new: &NewInvite) -> Result<(), StoreError> {
        let invite = &new.invite;
        let event = serde_json::to_string(&invite.event)?;
        let admins = serde_json::to_string(&invite.group_admin_pubkeys)?;
        let relays = serde_json::to_string(&invite.group_relays)?;
        self.with_tx(|tx| {
            tx.execute(
                "INSERT OR IGNORE INTO invites (event_id, account_pubkey, event,
                     mls_group_id, nostr_group_id, group_name, group_description,
                     group_admin_pubkeys, group_relays, inviter, member_count,
                     state, outer_event_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    invite.event_id.as_hex(),
                    invite.account_pubkey.as_hex(),
                    event,
                    invite.mls_group_id.as_hex(),
                    invite.nostr_group_id,
                    invite.group_name,
                    invite.group_description,
                    admins,
                    relays,
                    invite.inviter.as_hex(),
                    invite.member_count as i64,
                    invite.state.as_str(),
                    invite.outer_event_id.as_ref().map(|id| id.as_hex().to_owned()),
                ],
            )?;
            tx.execute(
                "INSERT OR IGNORE INTO processed_invites
                     (event_id, account_pubkey, invite_event_id, processed_at, state)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    new.wrapper_id.as_hex(),
                    invite.account_pubkey.as_hex(),
                    invite.event_id.as_hex(),
                    Timestamp::now().as_secs(),
                    ProcessedState::Processed.as_str(),
                ],
            )?;
            Ok(())
        })
    }

    /// Ledger-only record for a wrapping event that failed to yield an
    /// invite (unwrap or validation failure).
    pub fn record_invite_failure(&self, failure: &FailureRecord) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO processed_invites
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

    pub fn processed_invite(
        &self,
        wrapper_id: &EventId,
        account: &PublicKey,
    ) -> Result<Option<ProcessedInvite>, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT event_id, account_pubkey, invite_event_id, processed_at,
                        state, failure_reason
                 FROM processed_invites
                 WHERE event_id = ?1 AND account_pubkey = ?2",
                params![wrapper_id.as_hex(), account.as_hex()],
                |row| Ok(ProcessedInvite::from_row(row)),
            )
            .optional()?
            .transpose()
        })
    }

    pub fn get_invite(
        &self,
        event_id: &EventId,
        account: &PublicKey,
    ) -> Result<Option<Invite>, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {INVITE_COLS} FROM invites
                     WHERE event_id = ?1 AND account_pubkey = ?2"
                ),
                params![event_id.as_hex(), account.as_hex()],
                |row| Ok(Invite::from_row(row)),
            )
            .optional()?
            .transpose()
        })
    }

    pub fn list_invites(
        &self,
        account: &PublicKey,
        state: Option<InviteState>,
    ) -> Result<Vec<Invite>, StoreError> {
        self.with_conn(|conn| match state {
            Some(state) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {INVITE_COLS} FROM invites
                     WHERE account_pubkey = ?1 AND state = ?2 ORDER BY event_id"
                ))?;
                let rows = stmt.query_map(params![account.as_hex(), state.as_str()], |row| {
                    Ok(Invite::from_row(row))
                })?;
                rows.map(|r| r?).collect()
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {INVITE_COLS} FROM invites
                     WHERE account_pubkey = ?1 ORDER BY event_id"
                ))?;
                let rows =
                    stmt.query_map([account.as_hex()], |row| Ok(Invite::from_row(row)))?;
                rows.map(|r| r?).collect()
            }
        })
    }

    /// One-shot transition out of `Pending`. Returns `false` when the
    /// invite was not pending, leaving the row untouched.
    pub fn resolve_invite(
        &self,
        event_id: &EventId,
        account: &PublicKey,
        state: InviteState,
    ) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE invites SET state = ?3
                 WHERE event_id = ?1 AND account_pubkey = ?2 AND state = 'pending'",
                params![event_id.as_hex(), account.as_hex(), state.as_str()],
            )?;
            Ok(changed == 1)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GroupId;

    fn pk(byte: u8) -> PublicKey {
        PublicKey::from_bytes(&[byte; 32])
    }

    fn eid(byte: u8) -> EventId {
        EventId::from_bytes([byte; 32])
    }

    fn sample_invite(account: &PublicKey) -> NewInvite {
        NewInvite {
            invite: Invite {
                event_id: eid(10),
                account_pubkey: account.clone(),
                event: serde_json::json!({"kind": 444}),
                mls_group_id: GroupId::from_slice(&[7u8; 32]),
                nostr_group_id: "beef".into(),
                group_name: "rustaceans".into(),
                group_description: String::new(),
                group_admin_pubkeys: vec![pk(9)],
                group_relays: vec!["wss://r.example".into()],
                inviter: pk(9),
                member_count: 3,
                state: InviteState::Pending,
                outer_event_id: Some(eid(20)),
            },
            wrapper_id: eid(20),
        }
    }

    fn store_with_account(account: &PublicKey) -> Store {
        let store = Store::open_in_memory().unwrap();
        store.insert_account(account).unwrap();
        store
    }

    #[test]
    fn record_writes_invite_and_ledger_together() {
        let account = pk(1);
        let store = store_with_account(&account);
        let new = sample_invite(&account);
        store.record_invite(&new).unwrap();

        assert!(store.get_invite(&eid(10), &account).unwrap().is_some());
        let ledger = store.processed_invite(&eid(20), &account).unwrap().unwrap();
        assert_eq!(ledger.state, ProcessedState::Processed);
        assert_eq!(ledger.invite_event_id, Some(eid(10)));
    }

    #[test]
    fn ledger_row_is_append_only() {
        let account = pk(1);
        let store = store_with_account(&account);
        store.record_invite(&sample_invite(&account)).unwrap();
        store
            .record_invite_failure(&FailureRecord {
                wrapper_id: eid(20),
                account_pubkey: account.clone(),
                reason: "later failure".into(),
            })
            .unwrap();

        let ledger = store.processed_invite(&eid(20), &account).unwrap().unwrap();
        assert_eq!(ledger.state, ProcessedState::Processed);
        assert!(ledger.failure_reason.is_none());
    }

    #[test]
    fn invite_resolves_exactly_once() {
        let account = pk(1);
        let store = store_with_account(&account);
        store.record_invite(&sample_invite(&account)).unwrap();

        assert!(store
            .resolve_invite(&eid(10), &account, InviteState::Accepted)
            .unwrap());
        assert!(!store
            .resolve_invite(&eid(10), &account, InviteState::Declined)
            .unwrap());

        let invite = store.get_invite(&eid(10), &account).unwrap().unwrap();
        assert_eq!(invite.state, InviteState::Accepted);
    }

    #[test]
    fn failure_recorded_without_invite_row() {
        let account = pk(1);
        let store = store_with_account(&account);
        store
            .record_invite_failure(&FailureRecord {
                wrapper_id: eid(30),
                account_pubkey: account.clone(),
                reason: "unwrap failed".into(),
            })
            .unwrap();

        let ledger = store.processed_invite(&eid(30), &account).unwrap().unwrap();
        assert_eq!(ledger.state, ProcessedState::Failed);
        assert_eq!(ledger.failure_reason.as_deref(), Some("unwrap failed"));
        assert!(ledger.invite_event_id.is_none());
    }

    #[test]
    fn pending_filter() {
        let account = pk(1);
        let store = store_with_account(&account);
        store.record_invite(&sample_invite(&account)).unwrap();
        store
            .resolve_invite(&eid(10), &account, InviteState::Declined)
            .unwrap();

        assert!(store
            .list_invites(&account, Some(InviteState::Pending))
            .unwrap()
            .is_empty());
        assert_eq!(
            store
                .list_invites(&account, Some(InviteState::Declined))
                .unwrap()
                .len(),
            1
        );
    }
}
