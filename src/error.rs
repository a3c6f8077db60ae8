//! Crate-level error taxonomy.
//!
//! Per-module errors ([`StoreError`](crate::store::StoreError),
//! [`MlsEngineError`](crate::mls::MlsEngineError), ...) converge into
//! [`CoreError`], which distinguishes the failure classes the presentation
//! layer cares about: transport failures are retryable, crypto failures are
//! terminal for the event that caused them, and idempotent replays are not
//! errors at all.

use thiserror::Error;

use crate::gateway::GatewayError;
use crate::mls::MlsEngineError;
use crate::store::StoreError;

/// Result type alias for crate-level operations.
pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Unknown account, group, or invite.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed secret, handshake, or ciphertext supplied by the caller
    /// or the wire.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Authentication, decryption, or commit application failed at the
    /// group crypto engine. Terminal for the event that caused it; never
    /// retried automatically.
    #[error("crypto failure: {0}")]
    Crypto(#[from] MlsEngineError),

    /// The wrapping event was already processed; the prior outcome stands.
    /// Not a failure.
    #[error("already processed: {0}")]
    AlreadyProcessed(String),

    /// Transactional write failed; the operation is considered not-done.
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),

    /// Publish/fetch to the relay gateway failed. Retryable by the caller.
    #[error("transport failure: {0}")]
    Transport(#[from] GatewayError),

    /// An invite in a terminal state was asked to transition again.
    #[error("invite already {0}")]
    InviteAlreadyResolved(String),

    /// Joining a group from an invite failed at the crypto layer. The
    /// invite stays pending and the caller may retry.
    #[error("join failed: {0}")]
    JoinFailed(String),

    /// No account is currently active.
    #[error("no active session")]
    NoActiveSession,
}

impl CoreError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn invalid_input(what: impl Into<String>) -> Self {
        Self::InvalidInput(what.into())
    }

    /// Whether the presentation layer should offer a retry for this error.
    ///
    /// Transport failures can succeed on retry; crypto failures cannot
    /// succeed without further protocol action (e.g. an epoch-advancing
    /// commit).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::JoinFailed(_))
    }
}
