//! Shared identifiers and transport-level event types.
//!
//! Everything crossing the relay boundary is a [`RelayEvent`]: a signed,
//! content-addressed envelope. Inner (unsigned) payloads recovered from
//! gift wraps or MLS ciphertext are [`Rumor`]s with the same shape minus
//! the signature.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::CoreError;

/// Transport event kinds consumed or produced by this crate.
///
/// The numbers are a protocol contract (MLS-over-relay draft) and must not
/// be redefined locally.
pub mod kind {
    /// Published MLS key package.
    pub const KEY_PACKAGE: u16 = 443;
    /// Welcome rumor carrying admission material (always gift-wrapped).
    pub const WELCOME: u16 = 444;
    /// MLS ciphertext carrying an application message or commit.
    pub const GROUP_MESSAGE: u16 = 445;
    /// Sealed-sender wrapper used for metadata-hiding delivery.
    pub const GIFT_WRAP: u16 = 1059;
    /// Plaintext chat rumor kind inside a decrypted group message.
    pub const CHAT: u16 = 9;
    /// Profile metadata.
    pub const METADATA: u16 = 0;
    /// Deletion request for previously published events.
    pub const DELETION: u16 = 5;
    /// General relay list declaration.
    pub const RELAY_LIST: u16 = 10002;
    /// Inbox relay list declaration.
    pub const INBOX_RELAYS: u16 = 10050;
    /// Key-package relay list declaration.
    pub const KEY_PACKAGE_RELAYS: u16 = 10051;
}

/// A 32-byte x-only public key, hex encoded.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublicKey(String);

impl PublicKey {
    /// Parse from a 64-char lowercase hex string.
    pub fn parse(hex_str: &str) -> Result<Self, CoreError> {
        let bytes = hex::decode(hex_str)
            .map_err(|_| CoreError::invalid_input("public key is not valid hex"))?;
        if bytes.len() != 32 {
            return Err(CoreError::invalid_input("public key must be 32 bytes"));
        }
        Ok(Self(hex_str.to_lowercase()))
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self(hex::encode(bytes))
    }

    pub fn as_hex(&self) -> &str {
        &self.0
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        // Validated on construction.
        out.copy_from_slice(&hex::decode(&self.0).unwrap_or_else(|_| vec![0u8; 32]));
        out
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}..)", &self.0[..8.min(self.0.len())])
    }
}

/// A 32-byte event id, hex encoded. Content address of a [`RelayEvent`] or
/// [`Rumor`].
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub fn parse(hex_str: &str) -> Result<Self, CoreError> {
        let bytes = hex::decode(hex_str)
            .map_err(|_| CoreError::invalid_input("event id is not valid hex"))?;
        if bytes.len() != 32 {
            return Err(CoreError::invalid_input("event id must be 32 bytes"));
        }
        Ok(Self(hex_str.to_lowercase()))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(hex::encode(bytes))
    }

    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({}..)", &self.0[..8.min(self.0.len())])
    }
}

/// Seconds since the Unix epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        Self(chrono::Utc::now().timestamp())
    }

    pub fn as_secs(&self) -> i64 {
        self.0
    }
}

/// MLS protocol group identifier (opaque bytes), hex encoded for storage
/// and map keys. Distinct from the transport group id that tags kind-445
/// events on the wire.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(String);

impl GroupId {
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self(hex::encode(bytes))
    }

    pub fn parse(hex_str: &str) -> Result<Self, CoreError> {
        hex::decode(hex_str)
            .map_err(|_| CoreError::invalid_input("group id is not valid hex"))?;
        Ok(Self(hex_str.to_lowercase()))
    }

    pub fn as_hex(&self) -> &str {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        hex::decode(&self.0).unwrap_or_default()
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupId({}..)", &self.0[..8.min(self.0.len())])
    }
}

/// A signed transport event as delivered by (or published to) relays.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEvent {
    pub id: EventId,
    pub pubkey: PublicKey,
    pub created_at: Timestamp,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl RelayEvent {
    /// First value of the first tag named `name`, if present.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some(name))
            .and_then(|t| t.get(1))
            .map(String::as_str)
    }

    /// Transport group id carried in the `h` tag of kind-445 events.
    pub fn transport_group_id(&self) -> Option<&str> {
        self.tag_value("h")
    }
}

/// An unsigned inner event, recovered from a gift wrap or from decrypted
/// MLS application ciphertext.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rumor {
    pub id: EventId,
    pub pubkey: PublicKey,
    pub created_at: Timestamp,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl Rumor {
    /// Build a rumor, computing its content-addressed id.
    pub fn new(
        pubkey: PublicKey,
        created_at: Timestamp,
        kind: u16,
        tags: Vec<Vec<String>>,
        content: String,
    ) -> Self {
        let id = compute_event_id(&pubkey, created_at, kind, &tags, &content);
        Self {
            id,
            pubkey,
            created_at,
            kind,
            tags,
            content,
        }
    }

    /// Recompute the id from the fields and compare with the stored one.
    pub fn verify_id(&self) -> bool {
        compute_event_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        ) == self.id
    }

    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some(name))
            .and_then(|t| t.get(1))
            .map(String::as_str)
    }
}

/// SHA-256 over the canonical `[0, pubkey, created_at, kind, tags, content]`
/// serialization.
pub fn compute_event_id(
    pubkey: &PublicKey,
    created_at: Timestamp,
    kind: u16,
    tags: &[Vec<String>],
    content: &str,
) -> EventId {
    let canonical = serde_json::json!([
        0,
        pubkey.as_hex(),
        created_at.as_secs(),
        kind,
        tags,
        content,
    ]);
    let serialized = canonical.to_string();
    let digest = Sha256::digest(serialized.as_bytes());
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&digest);
    EventId::from_bytes(bytes)
}

/// Group kind: two-party direct message or many-party group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupType {
    DirectMessage,
    Group,
}

impl GroupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DirectMessage => "direct_message",
            Self::Group => "group",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "direct_message" => Ok(Self::DirectMessage),
            "group" => Ok(Self::Group),
            other => Err(CoreError::invalid_input(format!(
                "unknown group type: {other}"
            ))),
        }
    }
}

/// Group lifecycle state. An `Inactive` group accepts no new commits or
/// messages until administratively reactivated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupState {
    Active,
    Inactive,
}

impl GroupState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            other => Err(CoreError::invalid_input(format!(
                "unknown group state: {other}"
            ))),
        }
    }
}

/// Relay purpose classification for account- and group-level relay rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayPurpose {
    Read,
    Write,
    ReadWrite,
}

impl RelayPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::ReadWrite => "read_write",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            "read_write" => Ok(Self::ReadWrite),
            other => Err(CoreError::invalid_input(format!(
                "unknown relay purpose: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pk(byte: u8) -> PublicKey {
        PublicKey::from_bytes(&[byte; 32])
    }

    #[test]
    fn event_id_is_deterministic() {
        let a = compute_event_id(&pk(1), Timestamp(100), kind::CHAT, &[], "hello");
        let b = compute_event_id(&pk(1), Timestamp(100), kind::CHAT, &[], "hello");
        assert_eq!(a, b);
    }

    #[test]
    fn event_id_changes_with_content() {
        let a = compute_event_id(&pk(1), Timestamp(100), kind::CHAT, &[], "hello");
        let b = compute_event_id(&pk(1), Timestamp(100), kind::CHAT, &[], "hello!");
        assert_ne!(a, b);
    }

    #[test]
    fn rumor_id_verifies() {
        let rumor = Rumor::new(pk(2), Timestamp(123), kind::CHAT, vec![], "hi".into());
        assert!(rumor.verify_id());
    }

    #[test]
    fn tampered_rumor_fails_verification() {
        let mut rumor = Rumor::new(pk(2), Timestamp(123), kind::CHAT, vec![], "hi".into());
        rumor.content = "bye".into();
        assert!(!rumor.verify_id());
    }

    #[test]
    fn pubkey_rejects_bad_hex() {
        assert!(PublicKey::parse("zz").is_err());
        assert!(PublicKey::parse(&"ab".repeat(16)).is_ok());
        assert!(PublicKey::parse(&"ab".repeat(15)).is_err());
    }

    #[test]
    fn tag_lookup() {
        let ev = Rumor::new(
            pk(3),
            Timestamp(1),
            kind::GROUP_MESSAGE,
            vec![vec!["h".into(), "abcd".into()]],
            String::new(),
        );
        assert_eq!(ev.tag_value("h"), Some("abcd"));
        assert_eq!(ev.tag_value("p"), None);
    }
}
