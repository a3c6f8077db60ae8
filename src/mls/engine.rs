//! The engine seam.

use crate::types::{GroupId, PublicKey};

use super::error::MlsEngineError;
use super::types::{
    CreatedGroup, EngineCommit, EngineOutput, GroupDescriptor, JoinedGroup, KeyPackageMaterial,
    WelcomePreview,
};

/// Cryptographic group operations, keyed by MLS group id.
///
/// All methods take `&self`; implementations synchronize internally. The
/// session engine serializes calls per group anyway (commit application and
/// decryption against one group never interleave), so implementations only
/// need coarse locking.
pub trait GroupCryptoEngine: Send + Sync {
    /// Create a new group described by `descriptor`, adding the given
    /// key packages as initial members.
    fn create_group(
        &self,
        descriptor: &GroupDescriptor,
        member_key_packages: &[Vec<u8>],
    ) -> Result<CreatedGroup, MlsEngineError>;

    /// Inspect a welcome without changing any state.
    fn preview_welcome(&self, welcome: &[u8]) -> Result<WelcomePreview, MlsEngineError>;

    /// Join a group from a welcome addressed to one of our key packages.
    fn join_from_welcome(&self, welcome: &[u8]) -> Result<JoinedGroup, MlsEngineError>;

    /// Add members and merge the commit locally.
    fn add_members(
        &self,
        group: &GroupId,
        key_packages: &[Vec<u8>],
    ) -> Result<EngineCommit, MlsEngineError>;

    /// Remove members and merge the commit locally.
    fn remove_members(
        &self,
        group: &GroupId,
        members: &[PublicKey],
    ) -> Result<EngineCommit, MlsEngineError>;

    /// Encrypt an application payload into wire-framed ciphertext.
    fn encrypt_message(&self, group: &GroupId, plaintext: &[u8])
        -> Result<Vec<u8>, MlsEngineError>;

    /// Decrypt and process one inbound wire frame for `group`.
    fn process_wire_message(
        &self,
        group: &GroupId,
        wire: &[u8],
    ) -> Result<EngineOutput, MlsEngineError>;

    /// Generate a fresh single-use key package.
    fn generate_key_package(&self) -> Result<KeyPackageMaterial, MlsEngineError>;

    /// Export the current epoch's shared secret.
    fn export_secret(&self, group: &GroupId) -> Result<[u8; 32], MlsEngineError>;

    /// The engine's (cryptographic) epoch for `group`.
    fn current_epoch(&self, group: &GroupId) -> Result<u64, MlsEngineError>;

    /// Current member pubkeys of `group`.
    fn members(&self, group: &GroupId) -> Result<Vec<PublicKey>, MlsEngineError>;

    /// The group's authenticated metadata as the engine knows it.
    fn descriptor(&self, group: &GroupId) -> Result<GroupDescriptor, MlsEngineError>;

    /// Drop all in-memory group state. Called on logout and account switch.
    fn wipe(&self);
}
