//! Engine error types.

use openmls::{
    error::LibraryError,
    framing::errors::MlsMessageError,
    group::{AddMembersError, MergeCommitError, NewGroupError, RemoveMembersError, WelcomeError},
    prelude::{
        CreateMessageError, ExportSecretError, InvalidExtensionError, KeyPackageNewError,
        KeyPackageVerifyError, MergePendingCommitError, ProcessMessageError,
    },
};
use openmls_rust_crypto::MemoryStorageError;
use openmls_traits::types::CryptoError;
use thiserror::Error;

use crate::types::{GroupId, PublicKey};

/// Engine storage backend errors.
#[derive(Debug, Error)]
pub enum EngineStorageError {
    #[error("storage lock error: {0}")]
    Lock(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Errors from the group crypto engine.
///
/// Every variant is terminal for the event that produced it: retrying the
/// same ciphertext cannot succeed without further protocol action.
#[derive(Debug, Error)]
pub enum MlsEngineError {
    #[error("group not known to the engine: {0}")]
    GroupNotFound(GroupId),

    #[error("message epoch {message_epoch} does not match group epoch {group_epoch}")]
    EpochMismatch { message_epoch: u64, group_epoch: u64 },

    #[error("commit from non-admin member {sender}")]
    UnauthorizedCommit { sender: PublicKey },

    #[error("welcome does not contain any of our key packages")]
    WelcomeNotForUs,

    #[error("unexpected MLS message type")]
    UnexpectedMessageType,

    #[error("malformed wire frame: {0}")]
    MalformedFrame(String),

    #[error("wire decryption failed: {0}")]
    WireDecryption(String),

    #[error("group metadata extension missing or malformed")]
    MissingGroupData,

    #[error("invalid key package: {0}")]
    InvalidKeyPackage(#[from] KeyPackageVerifyError),

    #[error("failed to create key package: {0}")]
    KeyPackageNew(#[from] KeyPackageNewError),

    #[error("failed to create MLS group: {0}")]
    NewGroup(#[from] NewGroupError<MemoryStorageError>),

    #[error("failed to join from welcome: {0}")]
    Welcome(#[from] WelcomeError<MemoryStorageError>),

    #[error("failed to add members: {0}")]
    AddMembers(#[from] AddMembersError<MemoryStorageError>),

    #[error("failed to remove members: {0}")]
    RemoveMembers(#[from] RemoveMembersError<MemoryStorageError>),

    #[error("failed to merge pending commit: {0}")]
    MergePendingCommit(#[from] MergePendingCommitError<MemoryStorageError>),

    #[error("failed to merge staged commit: {0}")]
    MergeCommit(#[from] MergeCommitError<MemoryStorageError>),

    #[error("failed to process MLS message: {0}")]
    ProcessMessage(#[from] ProcessMessageError),

    #[error("failed to serialize MLS message: {0}")]
    MlsMessage(#[from] MlsMessageError),

    #[error("failed to create MLS message: {0}")]
    CreateMessage(#[from] CreateMessageError),

    #[error("failed to export secret: {0}")]
    ExportSecret(#[from] ExportSecretError),

    #[error("invalid group context extension: {0}")]
    InvalidExtension(#[from] InvalidExtensionError),

    #[error("MLS serialization error: {0}")]
    TlsCodec(#[from] tls_codec::Error),

    #[error("MLS library error: {0}")]
    Library(#[from] LibraryError),

    #[error("signer creation failed: {0}")]
    Crypto(#[from] CryptoError),

    #[error("group metadata serialization: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Storage(#[from] EngineStorageError),
}

impl MlsEngineError {
    /// Short reason string stored in the idempotency ledgers.
    pub fn ledger_reason(&self) -> String {
        match self {
            Self::EpochMismatch {
                message_epoch,
                group_epoch,
            } => format!("epoch mismatch: message={message_epoch} group={group_epoch}"),
            Self::UnauthorizedCommit { sender } => format!("unauthorized commit from {sender}"),
            Self::WelcomeNotForUs => "welcome not addressed to this account".to_string(),
            other => other.to_string(),
        }
    }
}
