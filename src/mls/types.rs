//! Engine operation inputs and results.

use serde::{Deserialize, Serialize};

use crate::types::{GroupId, GroupType, PublicKey};

/// Authenticated group metadata, carried inside the MLS group context so
/// every member (and every welcome) sees the same values.
///
/// `transport_group_id` is the wire-level tag for kind-445 events and is
/// distinct from the MLS group id: it can be rotated without rekeying.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDescriptor {
    pub name: String,
    pub description: String,
    pub admins: Vec<PublicKey>,
    pub relays: Vec<String>,
    pub transport_group_id: String,
    pub group_type: GroupType,
}

impl GroupDescriptor {
    pub fn is_admin(&self, pubkey: &PublicKey) -> bool {
        self.admins.contains(pubkey)
    }
}

/// Result of creating a group.
#[derive(Clone, Debug)]
pub struct CreatedGroup {
    pub group_id: GroupId,
    pub epoch: u64,
    /// Serialized welcome for the initial members, if any were added.
    pub welcome: Option<Vec<u8>>,
}

/// Result of a membership commit (add/remove).
#[derive(Clone, Debug)]
pub struct EngineCommit {
    /// Wire-framed commit ciphertext, ready to publish as a group message.
    pub commit_wire: Vec<u8>,
    /// Serialized welcome for added members, if any.
    pub welcome: Option<Vec<u8>>,
    /// Epoch after the commit was merged locally.
    pub new_epoch: u64,
}

/// Everything a joiner learns from a welcome, without mutating state.
#[derive(Clone, Debug)]
pub struct WelcomePreview {
    pub group_id: GroupId,
    pub descriptor: GroupDescriptor,
    pub epoch: u64,
}

/// Result of joining a group from a welcome.
#[derive(Clone, Debug)]
pub struct JoinedGroup {
    pub group_id: GroupId,
    pub descriptor: GroupDescriptor,
    pub epoch: u64,
    pub members: Vec<PublicKey>,
}

/// A freshly generated key package, ready to publish.
#[derive(Clone, Debug)]
pub struct KeyPackageMaterial {
    /// TLS-serialized key package.
    pub bytes: Vec<u8>,
    /// Hash reference used to recognize welcomes addressed to us.
    pub hash_ref: Vec<u8>,
}

/// Outcome of processing one inbound wire message for a group.
#[derive(Clone, Debug)]
pub enum EngineOutput {
    /// Decrypted application payload (serialized inner rumor).
    ApplicationMessage(Vec<u8>),
    /// A commit was validated and merged; the group advanced.
    CommitApplied { new_epoch: u64 },
    /// A proposal was stored for a later commit.
    ProposalStored,
    /// The commit removed us from the group.
    Removed { new_epoch: u64 },
    /// Message was not for this group; nothing changed.
    Ignored,
}
