//! Store entity types. These map directly to SQLite rows; JSON columns are
//! decoded at the row boundary so callers only see typed values.

use rusqlite::Row;
use serde::{Deserialize, Serialize};

use crate::types::{
    EventId, GroupId, GroupState, GroupType, PublicKey, RelayEvent, RelayPurpose, Timestamp,
};

use super::StoreError;

/// A local identity known to the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Account {
    pub pubkey: PublicKey,
    pub metadata: AccountMetadata,
    pub settings: serde_json::Value,
    pub onboarding: serde_json::Value,
    pub last_used: Timestamp,
    pub last_synced: Timestamp,
    pub active: bool,
}

/// Kind-0 profile fields kept for display. Everything optional; an account
/// that never synced has an empty profile.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nip05: Option<String>,
}

/// A relay URL with its declared purpose, scoped to an account or a group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relay {
    pub url: String,
    pub purpose: RelayPurpose,
}

/// One cryptographic group as seen by one account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Group {
    pub mls_group_id: GroupId,
    pub account_pubkey: PublicKey,
    /// Transport-level id tagging kind-445 events on the wire.
    pub nostr_group_id: String,
    pub name: String,
    pub description: String,
    pub admin_pubkeys: Vec<PublicKey>,
    pub epoch: u64,
    pub state: GroupState,
    pub last_message_id: Option<EventId>,
    pub last_message_at: Option<Timestamp>,
    pub group_type: GroupType,
}

impl Group {
    pub fn is_admin(&self, pubkey: &PublicKey) -> bool {
        self.admin_pubkeys.contains(pubkey)
    }
}

/// Invite lifecycle. `Pending` transitions to `Accepted` or `Declined`
/// exactly once; both are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InviteState {
    Pending,
    Accepted,
    Declined,
}

impl InviteState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Declined => "declined",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "accepted" => Ok(Self::Accepted),
            "declined" => Ok(Self::Declined),
            other => Err(StoreError::CorruptRow(format!(
                "unknown invite state: {other}"
            ))),
        }
    }
}

/// One admission handshake received for an account, keyed by the welcome
/// rumor's inner event id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invite {
    pub event_id: EventId,
    pub account_pubkey: PublicKey,
    /// The welcome rumor as received, for the eventual accept.
    pub event: serde_json::Value,
    pub mls_group_id: GroupId,
    pub nostr_group_id: String,
    pub group_name: String,
    pub group_description: String,
    pub group_admin_pubkeys: Vec<PublicKey>,
    pub group_relays: Vec<String>,
    pub inviter: PublicKey,
    pub member_count: u32,
    pub state: InviteState,
    /// The 1059 gift wrap id this arrived in, when double-wrapped.
    pub outer_event_id: Option<EventId>,
}

/// Outcome recorded in an idempotency ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessedState {
    Processed,
    Failed,
}

impl ProcessedState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "processed" => Ok(Self::Processed),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::CorruptRow(format!(
                "unknown ledger state: {other}"
            ))),
        }
    }
}

/// Ledger row for a wrapping event id seen by the invite pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessedInvite {
    pub event_id: EventId,
    pub account_pubkey: PublicKey,
    pub invite_event_id: Option<EventId>,
    pub processed_at: Timestamp,
    pub state: ProcessedState,
    pub failure_reason: Option<String>,
}

/// Ledger row for a wrapping event id seen by the message pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessedMessage {
    pub event_id: EventId,
    pub account_pubkey: PublicKey,
    pub message_event_id: Option<EventId>,
    pub processed_at: Timestamp,
    pub state: ProcessedState,
    pub failure_reason: Option<String>,
}

/// One decrypted application message, keyed by its inner event id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub event_id: EventId,
    pub account_pubkey: PublicKey,
    pub mls_group_id: GroupId,
    pub author_pubkey: PublicKey,
    pub created_at: Timestamp,
    pub content: String,
    pub tags: Vec<Vec<String>>,
    /// The signed-shape inner event as decrypted.
    pub event: serde_json::Value,
    pub outer_event_id: Option<EventId>,
}

pub(super) fn json_column<T: serde::de::DeserializeOwned>(
    text: &str,
    what: &str,
) -> Result<T, StoreError> {
    serde_json::from_str(text)
        .map_err(|e| StoreError::CorruptRow(format!("bad {what} json: {e}")))
}

pub(super) fn pubkey_column(text: &str, what: &str) -> Result<PublicKey, StoreError> {
    PublicKey::parse(text).map_err(|_| StoreError::CorruptRow(format!("bad {what} pubkey")))
}

pub(super) fn event_id_column(text: &str, what: &str) -> Result<EventId, StoreError> {
    EventId::parse(text).map_err(|_| StoreError::CorruptRow(format!("bad {what} event id")))
}

impl Account {
    pub(super) fn from_row(row: &Row<'_>) -> Result<Self, StoreError> {
        let pubkey: String = row.get("pubkey")?;
        let metadata: String = row.get("metadata")?;
        let settings: String = row.get("settings")?;
        let onboarding: String = row.get("onboarding")?;
        Ok(Self {
            pubkey: pubkey_column(&pubkey, "account")?,
            metadata: json_column(&metadata, "account metadata")?,
            settings: json_column(&settings, "account settings")?,
            onboarding: json_column(&onboarding, "account onboarding")?,
            last_used: Timestamp(row.get("last_used")?),
            last_synced: Timestamp(row.get("last_synced")?),
            active: row.get::<_, i64>("active")? != 0,
        })
    }
}

impl Group {
    pub(super) fn from_row(row: &Row<'_>) -> Result<Self, StoreError> {
        let mls_group_id: String = row.get("mls_group_id")?;
        let account_pubkey: String = row.get("account_pubkey")?;
        let admin_pubkeys: String = row.get("admin_pubkeys")?;
        let state: String = row.get("state")?;
        let group_type: String = row.get("group_type")?;
        let last_message_id: Option<String> = row.get("last_message_id")?;
        Ok(Self {
            mls_group_id: GroupId::parse(&mls_group_id)
                .map_err(|_| StoreError::CorruptRow("bad group id".into()))?,
            account_pubkey: pubkey_column(&account_pubkey, "group account")?,
            nostr_group_id: row.get("nostr_group_id")?,
            name: row.get("name")?,
            description: row.get("description")?,
            admin_pubkeys: json_column(&admin_pubkeys, "group admins")?,
            epoch: row.get::<_, i64>("epoch")? as u64,
            state: GroupState::parse(&state)
                .map_err(|_| StoreError::CorruptRow(format!("unknown group state: {state}")))?,
            last_message_id: last_message_id
                .map(|id| event_id_column(&id, "group last message"))
                .transpose()?,
            last_message_at: row
                .get::<_, Option<i64>>("last_message_at")?
                .map(Timestamp),
            group_type: GroupType::parse(&group_type)
                .map_err(|_| StoreError::CorruptRow(format!("unknown group type: {group_type}")))?,
        })
    }
}

impl Invite {
    pub(super) fn from_row(row: &Row<'_>) -> Result<Self, StoreError> {
        let event_id: String = row.get("event_id")?;
        let account_pubkey: String = row.get("account_pubkey")?;
        let event: String = row.get("event")?;
        let mls_group_id: String = row.get("mls_group_id")?;
        let admins: String = row.get("group_admin_pubkeys")?;
        let relays: String = row.get("group_relays")?;
        let inviter: String = row.get("inviter")?;
        let state: String = row.get("state")?;
        let outer: Option<String> = row.get("outer_event_id")?;
        Ok(Self {
            event_id: event_id_column(&event_id, "invite")?,
            account_pubkey: pubkey_column(&account_pubkey, "invite account")?,
            event: json_column(&event, "invite event")?,
            mls_group_id: GroupId::parse(&mls_group_id)
                .map_err(|_| StoreError::CorruptRow("bad invite group id".into()))?,
            nostr_group_id: row.get("nostr_group_id")?,
            group_name: row.get("group_name")?,
            group_description: row.get("group_description")?,
            group_admin_pubkeys: json_column(&admins, "invite admins")?,
            group_relays: json_column(&relays, "invite relays")?,
            inviter: pubkey_column(&inviter, "invite inviter")?,
            member_count: row.get::<_, i64>("member_count")? as u32,
            state: InviteState::parse(&state)?,
            outer_event_id: outer
                .map(|id| event_id_column(&id, "invite outer"))
                .transpose()?,
        })
    }

    /// Reconstruct the welcome rumor captured at receipt time.
    pub fn welcome_rumor(&self) -> Result<crate::types::Rumor, StoreError> {
        serde_json::from_value(self.event.clone())
            .map_err(|e| StoreError::CorruptRow(format!("bad invite rumor: {e}")))
    }
}

impl Message {
    pub(super) fn from_row(row: &Row<'_>) -> Result<Self, StoreError> {
        let event_id: String = row.get("event_id")?;
        let account_pubkey: String = row.get("account_pubkey")?;
        let mls_group_id: String = row.get("mls_group_id")?;
        let author: String = row.get("author_pubkey")?;
        let tags: String = row.get("tags")?;
        let event: String = row.get("event")?;
        let outer: Option<String> = row.get("outer_event_id")?;
        Ok(Self {
            event_id: event_id_column(&event_id, "message")?,
            account_pubkey: pubkey_column(&account_pubkey, "message account")?,
            mls_group_id: GroupId::parse(&mls_group_id)
                .map_err(|_| StoreError::CorruptRow("bad message group id".into()))?,
            author_pubkey: pubkey_column(&author, "message author")?,
            created_at: Timestamp(row.get("created_at")?),
            content: row.get("content")?,
            tags: json_column(&tags, "message tags")?,
            event: json_column(&event, "message event")?,
            outer_event_id: outer
                .map(|id| event_id_column(&id, "message outer"))
                .transpose()?,
        })
    }
}

impl ProcessedInvite {
    pub(super) fn from_row(row: &Row<'_>) -> Result<Self, StoreError> {
        let event_id: String = row.get("event_id")?;
        let account_pubkey: String = row.get("account_pubkey")?;
        let invite_event_id: Option<String> = row.get("invite_event_id")?;
        let state: String = row.get("state")?;
        Ok(Self {
            event_id: event_id_column(&event_id, "processed invite")?,
            account_pubkey: pubkey_column(&account_pubkey, "processed invite account")?,
            invite_event_id: invite_event_id
                .map(|id| event_id_column(&id, "processed invite target"))
                .transpose()?,
            processed_at: Timestamp(row.get("processed_at")?),
            state: ProcessedState::parse(&state)?,
            failure_reason: row.get("failure_reason")?,
        })
    }
}

impl ProcessedMessage {
    pub(super) fn from_row(row: &Row<'_>) -> Result<Self, StoreError> {
        let event_id: String = row.get("event_id")?;
        let account_pubkey: String = row.get("account_pubkey")?;
        let message_event_id: Option<String> = row.get("message_event_id")?;
        let state: String = row.get("state")?;
        Ok(Self {
            event_id: event_id_column(&event_id, "processed message")?,
            account_pubkey: pubkey_column(&account_pubkey, "processed message account")?,
            message_event_id: message_event_id
                .map(|id| event_id_column(&id, "processed message target"))
                .transpose()?,
            processed_at: Timestamp(row.get("processed_at")?),
            state: ProcessedState::parse(&state)?,
            failure_reason: row.get("failure_reason")?,
        })
    }
}

/// Parameters for recording a new invite together with its ledger row.
#[derive(Clone, Debug)]
pub struct NewInvite {
    pub invite: Invite,
    /// Wrapping (outer) event id keying the ledger row.
    pub wrapper_id: EventId,
}

/// Parameters for recording a decrypted message together with its ledger row.
#[derive(Clone, Debug)]
pub struct NewMessage {
    pub message: Message,
    /// Wrapping (outer 445) event id keying the ledger row.
    pub wrapper_id: EventId,
}

/// An inbound event that failed processing, for ledger-only records.
#[derive(Clone, Debug)]
pub struct FailureRecord {
    pub wrapper_id: EventId,
    pub account_pubkey: PublicKey,
    pub reason: String,
}

impl FailureRecord {
    pub fn new(event: &RelayEvent, account: &PublicKey, reason: impl Into<String>) -> Self {
        Self {
            wrapper_id: event.id.clone(),
            account_pubkey: account.clone(),
            reason: reason.into(),
        }
    }
}
