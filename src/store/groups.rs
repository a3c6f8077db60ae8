//! Group rows. The stored epoch is the authoritative value for dedup and
//! ordering decisions; it only moves forward.

use rusqlite::{params, OptionalExtension};

use crate::types::{EventId, GroupId, GroupState, PublicKey, Timestamp};

use super::models::{Group, Relay};
use super::{Store, StoreError};

const GROUP_COLS: &str = "mls_group_id, account_pubkey, nostr_group_id, name, description, \
     admin_pubkeys, epoch, state, last_message_id, last_message_at, group_type";

impl Store {
    pub fn upsert_group(&self, group: &Group) -> Result<(), StoreError> {
        let admins = serde_json::to_string(&group.admin_pubkeys)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO groups (mls_group_id, account_pubkey, nostr_group_id, name,
                     description, admin_pubkeys, epoch, state, last_message_id,
                     last_message_at, group_type)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT (mls_group_id, account_pubkey) DO UPDATE SET
                     nostr_group_id = excluded.nostr_group_id,
                     name = excluded.name,
                     description = excluded.description,
                     admin_pubkeys = excluded.admin_pubkeys,
                     epoch = MAX(groups.epoch, excluded.epoch),
                     state = excluded.state,
                     group_type = excluded.group_type",
                params![
                    group.mls_group_id.as_hex(),
                    group.account_pubkey.as_hex(),
                    group.nostr_group_id,
                    group.name,
                    group.description,
                    admins,
                    group.epoch as i64,
                    group.state.as_str(),
                    group.last_message_id.as_ref().map(|id| id.as_hex().to_owned()),
                    group.last_message_at.map(|t| t.as_secs()),
                    group.group_type.as_str(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_group(
        &self,
        group_id: &GroupId,
        account: &PublicKey,
    ) -> Result<Option<Group>, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {GROUP_COLS} FROM groups
                     WHERE mls_group_id = ?1 AND account_pubkey = ?2"
                ),
                params![group_id.as_hex(), account.as_hex()],
                |row| Ok(Group::from_row(row)),
            )
            .optional()?
            .transpose()
        })
    }

    /// Resolve by the transport-level id carried in a kind-445 `h` tag.
    pub fn find_group_by_transport_id(
        &self,
        nostr_group_id: &str,
        account: &PublicKey,
    ) -> Result<Option<Group>, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {GROUP_COLS} FROM groups
                     WHERE nostr_group_id = ?1 AND account_pubkey = ?2"
                ),
                params![nostr_group_id, account.as_hex()],
                |row| Ok(Group::from_row(row)),
            )
            .optional()?
            .transpose()
        })
    }

    pub fn list_groups(&self, account: &PublicKey) -> Result<Vec<Group>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {GROUP_COLS} FROM groups WHERE account_pubkey = ?1
                 ORDER BY last_message_at DESC NULLS LAST, name"
            ))?;
            let rows = stmt.query_map([account.as_hex()], |row| Ok(Group::from_row(row)))?;
            rows.map(|r| r?).collect()
        })
    }

    pub fn set_group_state(
        &self,
        group_id: &GroupId,
        account: &PublicKey,
        state: GroupState,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE groups SET state = ?3
                 WHERE mls_group_id = ?1 AND account_pubkey = ?2",
                params![group_id.as_hex(), account.as_hex(), state.as_str()],
            )?;
            Ok(())
        })
    }

    /// Advance the stored epoch. A lower value than the current one is a
    /// no-op; epochs never move backwards.
    pub fn advance_group_epoch(
        &self,
        group_id: &GroupId,
        account: &PublicKey,
        epoch: u64,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE groups SET epoch = ?3
                 WHERE mls_group_id = ?1 AND account_pubkey = ?2 AND epoch < ?3",
                params![group_id.as_hex(), account.as_hex(), epoch as i64],
            )?;
            Ok(())
        })
    }

    /// Refresh the denormalized last-message columns if `created_at` is the
    /// newest seen for the group.
    pub fn update_group_last_message(
        &self,
        group_id: &GroupId,
        account: &PublicKey,
        message_id: &EventId,
        created_at: Timestamp,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE groups SET last_message_id = ?3, last_message_at = ?4
                 WHERE mls_group_id = ?1 AND account_pubkey = ?2
                   AND (last_message_at IS NULL OR last_message_at <= ?4)",
                params![
                    group_id.as_hex(),
                    account.as_hex(),
                    message_id.as_hex(),
                    created_at.as_secs(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn replace_group_relays(
        &self,
        group_id: &GroupId,
        account: &PublicKey,
        relays: &[Relay],
    ) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            tx.execute(
                "DELETE FROM group_relays
                 WHERE mls_group_id = ?1 AND account_pubkey = ?2",
                params![group_id.as_hex(), account.as_hex()],
            )?;
            for relay in relays {
                tx.execute(
                    "INSERT INTO group_relays (url, purpose, mls_group_id, account_pubkey)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        relay.url,
                        relay.purpose.as_str(),
                        group_id.as_hex(),
                        account.as_hex(),
                    ],
                )?;
            }
            Ok(())
        })
    }

    pub fn group_relays(
        &self,
        group_id: &GroupId,
        account: &PublicKey,
    ) -> Result<Vec<Relay>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT url, purpose FROM group_relays
                 WHERE mls_group_id = ?1 AND account_pubkey = ?2 ORDER BY url",
            )?;
            let rows = stmt.query_map(params![group_id.as_hex(), account.as_hex()], |row| {
                let url: String = row.get(0)?;
                let purpose: String = row.get(1)?;
                Ok((url, purpose))
            })?;
            rows.map(|r| {
                let (url, purpose) = r?;
                Ok(Relay {
                    url,
                    purpose: crate::types::RelayPurpose::parse(&purpose)
                        .map_err(|_| StoreError::CorruptRow(format!("bad purpose: {purpose}")))?,
                })
            })
            .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GroupType, RelayPurpose};

    fn pk(byte: u8) -> PublicKey {
        PublicKey::from_bytes(&[byte; 32])
    }

    fn sample_group(account: &PublicKey) -> Group {
        Group {
            mls_group_id: GroupId::from_slice(&[7u8; 32]),
            account_pubkey: account.clone(),
            nostr_group_id: "beef".into(),
            name: "rustaceans".into(),
            description: String::new(),
            admin_pubkeys: vec![account.clone()],
            epoch: 0,
            state: GroupState::Active,
            last_message_id: None,
            last_message_at: None,
            group_type: GroupType::Group,
        }
    }

    fn store_with_account(account: &PublicKey) -> Store {
        let store = Store::open_in_memory().unwrap();
        store.insert_account(account).unwrap();
        store
    }

    #[test]
    fn epoch_never_regresses() {
        let account = pk(1);
        let store = store_with_account(&account);
        let group = sample_group(&account);
        store.upsert_group(&group).unwrap();

        store
            .advance_group_epoch(&group.mls_group_id, &account, 5)
            .unwrap();
        store
            .advance_group_epoch(&group.mls_group_id, &account, 3)
            .unwrap();

        let loaded = store
            .get_group(&group.mls_group_id, &account)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.epoch, 5);
    }

    #[test]
    fn upsert_keeps_higher_epoch() {
        let account = pk(1);
        let store = store_with_account(&account);
        let mut group = sample_group(&account);
        group.epoch = 4;
        store.upsert_group(&group).unwrap();

        group.epoch = 2;
        group.name = "renamed".into();
        store.upsert_group(&group).unwrap();

        let loaded = store
            .get_group(&group.mls_group_id, &account)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.epoch, 4);
        assert_eq!(loaded.name, "renamed");
    }

    #[test]
    fn last_message_only_moves_forward() {
        let account = pk(1);
        let store = store_with_account(&account);
        let group = sample_group(&account);
        store.upsert_group(&group).unwrap();

        let newer = EventId::from_bytes([1u8; 32]);
        let older = EventId::from_bytes([2u8; 32]);
        store
            .update_group_last_message(&group.mls_group_id, &account, &newer, Timestamp(200))
            .unwrap();
        store
            .update_group_last_message(&group.mls_group_id, &account, &older, Timestamp(100))
            .unwrap();

        let loaded = store
            .get_group(&group.mls_group_id, &account)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.last_message_id, Some(newer));
        assert_eq!(loaded.last_message_at, Some(Timestamp(200)));
    }

    #[test]
    fn transport_id_lookup() {
        let account = pk(1);
        let store = store_with_account(&account);
        store.upsert_group(&sample_group(&account)).unwrap();

        assert!(store
            .find_group_by_transport_id("beef", &account)
            .unwrap()
            .is_some());
        assert!(store
            .find_group_by_transport_id("dead", &account)
            .unwrap()
            .is_none());
    }

    #[test]
    fn groups_scoped_per_account() {
        let a = pk(1);
        let b = pk(2);
        let store = store_with_account(&a);
        store.insert_account(&b).unwrap();
        store.upsert_group(&sample_group(&a)).unwrap();

        assert_eq!(store.list_groups(&a).unwrap().len(), 1);
        assert!(store.list_groups(&b).unwrap().is_empty());
    }

    #[test]
    fn deleting_group_account_removes_group_relays() {
        let account = pk(1);
        let store = store_with_account(&account);
        let group = sample_group(&account);
        store.upsert_group(&group).unwrap();
        store
            .replace_group_relays(
                &group.mls_group_id,
                &account,
                &[Relay {
                    url: "wss://g.example".into(),
                    purpose: RelayPurpose::ReadWrite,
                }],
            )
            .unwrap();

        store.delete_account(&account).unwrap();
        assert!(store
            .group_relays(&group.mls_group_id, &account)
            .unwrap()
            .is_empty());
    }
}
