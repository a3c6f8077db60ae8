//! OpenMLS-backed engine implementation.
//!
//! Adapted group management: groups are cached in memory by [`GroupId`],
//! authenticated metadata rides in a group context extension so welcomes
//! carry it, and application/commit traffic crosses the relay in a framed
//! exporter-secret envelope (epoch ‖ nonce ‖ AES-256-GCM ciphertext) so the
//! relay never sees raw MLS framing.

use std::collections::HashMap;
use std::sync::RwLock;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use openmls::credentials::CredentialWithKey;
use openmls::group::{MlsGroup, MlsGroupCreateConfig, MlsGroupJoinConfig};
use openmls::prelude::{
    BasicCredential, Capabilities, Ciphersuite, DeserializeBytes, Extension, ExtensionType,
    Extensions, KeyPackage, KeyPackageIn, LeafNodeIndex, MlsMessageBodyIn, MlsMessageIn,
    ProcessedMessageContent, ProcessedWelcome, ProtocolMessage, ProtocolVersion, StagedWelcome,
    UnknownExtension, Welcome,
};
use openmls_basic_credential::SignatureKeyPair;
use openmls_rust_crypto::{MemoryStorage, RustCrypto};
use openmls_traits::OpenMlsProvider;
use rand::RngCore;
use tls_codec::Serialize as TlsSerialize;
use tracing::debug;

use crate::types::{GroupId, PublicKey};

use super::engine::GroupCryptoEngine;
use super::error::{EngineStorageError, MlsEngineError};
use super::storage::EngineStorage;
use super::types::{
    CreatedGroup, EngineCommit, EngineOutput, GroupDescriptor, JoinedGroup, KeyPackageMaterial,
    WelcomePreview,
};

/// The MLS ciphersuite used for all operations.
pub const CIPHERSUITE: Ciphersuite = Ciphersuite::MLS_128_DHKEMX25519_AES128GCM_SHA256_Ed25519;

/// Group context extension type carrying the serialized [`GroupDescriptor`].
pub const GROUP_DATA_EXTENSION_TYPE: u16 = 0xF2EE;

const EXPORTER_LABEL: &str = "covey";
const FRAME_HEADER_LEN: usize = 8 + 12;

/// Internal OpenMLS provider that wraps storage.
struct MlsProvider<'a> {
    crypto: &'a RustCrypto,
    storage: &'a MemoryStorage,
}

impl<'a> OpenMlsProvider for MlsProvider<'a> {
    type CryptoProvider = RustCrypto;
    type RandProvider = RustCrypto;
    type StorageProvider = MemoryStorage;

    fn crypto(&self) -> &Self::CryptoProvider {
        self.crypto
    }

    fn rand(&self) -> &Self::RandProvider {
        self.crypto
    }

    fn storage(&self) -> &Self::StorageProvider {
        self.storage
    }
}

struct IdentityData {
    credential: CredentialWithKey,
    signer: SignatureKeyPair,
}

/// OpenMLS engine bound to one account identity.
///
/// One engine instance exists per active session; an account switch builds
/// a fresh one. Group state lives both here (cache) and in the OpenMLS
/// storage provider.
pub struct MlsEngine<S: EngineStorage> {
    storage: S,
    crypto: RustCrypto,
    account: PublicKey,
    identity: IdentityData,
    groups: RwLock<HashMap<GroupId, MlsGroup>>,
}

impl<S> MlsEngine<S>
where
    S: EngineStorage<MlsStorage = MemoryStorage>,
{
    /// Create an engine for `account`, reusing the signing identity from a
    /// previous run when the backend has one, otherwise generating MLS
    /// credentials bound to its public key.
    pub fn new(storage: S, account: PublicKey) -> Result<Self, MlsEngineError> {
        let credential = BasicCredential::new(account.to_bytes().to_vec());
        let signer = match storage.identity()? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => {
                let signer = SignatureKeyPair::new(CIPHERSUITE.signature_algorithm())?;
                signer
                    .store(storage.mls_storage())
                    .map_err(|e| EngineStorageError::Backend(e.to_string()))?;
                storage.store_identity(&serde_json::to_vec(&signer)?)?;
                storage.persist()?;
                signer
            }
        };

        let identity = IdentityData {
            credential: CredentialWithKey {
                credential: credential.into(),
                signature_key: signer.to_public_vec().into(),
            },
            signer,
        };

        Ok(Self {
            storage,
            crypto: RustCrypto::default(),
            account,
            identity,
            groups: RwLock::new(HashMap::new()),
        })
    }

    pub fn account(&self) -> &PublicKey {
        &self.account
    }

    fn make_provider(&self) -> MlsProvider<'_> {
        MlsProvider {
            crypto: &self.crypto,
            storage: self.storage.mls_storage(),
        }
    }

    /// Leaf capabilities advertising support for the group data extension.
    fn capabilities() -> Capabilities {
        Capabilities::new(
            None,
            Some(&[CIPHERSUITE]),
            Some(&[ExtensionType::Unknown(GROUP_DATA_EXTENSION_TYPE)]),
            None,
            None,
        )
    }

    fn groups_read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<GroupId, MlsGroup>>, MlsEngineError> {
        self.groups
            .read()
            .map_err(|e| EngineStorageError::Lock(e.to_string()).into())
    }

    fn groups_write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<GroupId, MlsGroup>>, MlsEngineError> {
        self.groups
            .write()
            .map_err(|e| EngineStorageError::Lock(e.to_string()).into())
    }

    fn parse_key_package(
        &self,
        bytes: &[u8],
    ) -> Result<KeyPackage, MlsEngineError> {
        let (kp_in, _) = KeyPackageIn::tls_deserialize_bytes(bytes)?;
        Ok(kp_in.validate(&self.crypto, ProtocolVersion::Mls10)?)
    }

    fn descriptor_from_group(group: &MlsGroup) -> Result<GroupDescriptor, MlsEngineError> {
        descriptor_from_extensions(group.extensions())
    }

    fn member_pubkeys(group: &MlsGroup) -> Vec<PublicKey> {
        group
            .members()
            .filter_map(|m| {
                let bytes: [u8; 32] = m.credential.serialized_content().try_into().ok()?;
                Some(PublicKey::from_bytes(&bytes))
            })
            .collect()
    }

    /// Export and cache the exporter secret for the group's current epoch.
    fn refresh_exporter_secret(
        &self,
        group_id: &GroupId,
        group: &MlsGroup,
    ) -> Result<(u64, [u8; 32]), MlsEngineError> {
        let provider = self.make_provider();
        let epoch = group.epoch().as_u64();
        let exported = group.export_secret(&provider, EXPORTER_LABEL, &group_id.to_vec(), 32)?;
        let mut secret = [0u8; 32];
        secret.copy_from_slice(&exported);
        self.storage
            .store_exporter_secret(group_id, epoch, secret)?;
        Ok((epoch, secret))
    }

    /// Frame MLS bytes for the wire: `epoch ‖ nonce ‖ AES-256-GCM(ct)`.
    fn frame_for_wire(
        epoch: u64,
        secret: &[u8; 32],
        mls_bytes: &[u8],
    ) -> Result<Vec<u8>, MlsEngineError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(secret));
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), mls_bytes)
            .map_err(|e| MlsEngineError::WireDecryption(e.to_string()))?;

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + ciphertext.len());
        frame.extend_from_slice(&epoch.to_be_bytes());
        frame.extend_from_slice(&nonce_bytes);
        frame.extend_from_slice(&ciphertext);
        Ok(frame)
    }

    fn unframe_from_wire(
        &self,
        group_id: &GroupId,
        group: &MlsGroup,
        wire: &[u8],
    ) -> Result<Vec<u8>, MlsEngineError> {
        if wire.len() <= FRAME_HEADER_LEN {
            return Err(MlsEngineError::MalformedFrame(format!(
                "frame too short: {} bytes",
                wire.len()
            )));
        }
        let frame_epoch = u64::from_be_bytes(
            wire[..8]
                .try_into()
                .map_err(|_| MlsEngineError::MalformedFrame("bad epoch header".into()))?,
        );
        let group_epoch = group.epoch().as_u64();
        if frame_epoch != group_epoch {
            return Err(MlsEngineError::EpochMismatch {
                message_epoch: frame_epoch,
                group_epoch,
            });
        }

        let secret = match self.storage.exporter_secret(group_id, frame_epoch)? {
            Some(secret) => secret,
            None => self.refresh_exporter_secret(group_id, group)?.1,
        };

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&secret));
        cipher
            .decrypt(Nonce::from_slice(&wire[8..FRAME_HEADER_LEN]), &wire[FRAME_HEADER_LEN..])
            .map_err(|e| MlsEngineError::WireDecryption(e.to_string()))
    }

    /// Deserialize a welcome and confirm it addresses one of our key
    /// packages, returning their hash refs. The refs stay registered until
    /// the join actually lands.
    fn checked_welcome(
        &self,
        welcome_bytes: &[u8],
    ) -> Result<(Welcome, Vec<Vec<u8>>), MlsEngineError> {
        let (mls_message, _) = MlsMessageIn::tls_deserialize_bytes(welcome_bytes)?;
        let welcome = match mls_message.extract() {
            MlsMessageBodyIn::Welcome(w) => w,
            _ => return Err(MlsEngineError::UnexpectedMessageType),
        };

        let our_refs: Vec<Vec<u8>> = welcome
            .secrets()
            .iter()
            .filter(|s| {
                self.storage
                    .is_our_key_package(s.new_member().as_slice())
                    .unwrap_or(false)
            })
            .map(|s| s.new_member().as_slice().to_vec())
            .collect();
        if our_refs.is_empty() {
            return Err(MlsEngineError::WelcomeNotForUs);
        }
        Ok((welcome, our_refs))
    }

    fn staged_welcome(
        &self,
        welcome_bytes: &[u8],
    ) -> Result<(StagedWelcome, Vec<Vec<u8>>), MlsEngineError> {
        let provider = self.make_provider();
        let (welcome, our_refs) = self.checked_welcome(welcome_bytes)?;
        let config = MlsGroupJoinConfig::builder().build();
        let staged = StagedWelcome::new_from_welcome(&provider, &config, welcome, None)?;
        Ok((staged, our_refs))
    }

    /// Pull a group out of MLS storage into the cache if it is not resident.
    /// A fresh engine over a durable backend starts with an empty cache even
    /// though its groups survived the restart.
    fn ensure_group_loaded(&self, group_id: &GroupId) -> Result<(), MlsEngineError> {
        if self.groups_read()?.contains_key(group_id) {
            return Ok(());
        }
        let mls_gid = openmls::group::GroupId::from_slice(&group_id.to_vec());
        let loaded = MlsGroup::load(self.storage.mls_storage(), &mls_gid)
            .map_err(|e| EngineStorageError::Backend(e.to_string()))?;
        if let Some(group) = loaded {
            self.groups_write()?.entry(group_id.clone()).or_insert(group);
        }
        Ok(())
    }
}

fn descriptor_from_extensions(
    extensions: &Extensions,
) -> Result<GroupDescriptor, MlsEngineError> {
    let data = extensions
        .iter()
        .find_map(|ext| match ext {
            Extension::Unknown(GROUP_DATA_EXTENSION_TYPE, UnknownExtension(bytes)) => {
                Some(bytes.clone())
            }
            _ => None,
        })
        .ok_or(MlsEngineError::MissingGroupData)?;
    serde_json::from_slice(&data).map_err(|_| MlsEngineError::MissingGroupData)
}

impl<S> GroupCryptoEngine for MlsEngine<S>
where
    S: EngineStorage<MlsStorage = MemoryStorage>,
{
    fn create_group(
        &self,
        descriptor: &GroupDescriptor,
        member_key_packages: &[Vec<u8>],
    ) -> Result<CreatedGroup, MlsEngineError> {
        let provider = self.make_provider();

        let descriptor_bytes = serde_json::to_vec(descriptor)?;
        let config = MlsGroupCreateConfig::builder()
            .use_ratchet_tree_extension(true)
            .capabilities(Self::capabilities())
            .with_group_context_extensions(Extensions::single(Extension::Unknown(
                GROUP_DATA_EXTENSION_TYPE,
                UnknownExtension(descriptor_bytes),
            )))?
            .build();

        let mut group = MlsGroup::new(
            &provider,
            &self.identity.signer,
            &config,
            self.identity.credential.clone(),
        )?;
        let group_id = GroupId::from_slice(group.group_id().as_slice());

        let mut welcome_bytes = None;
        if !member_key_packages.is_empty() {
            let key_packages = member_key_packages
                .iter()
                .map(|bytes| self.parse_key_package(bytes))
                .collect::<Result<Vec<_>, _>>()?;

            let (_commit, welcome, _info) =
                group.add_members(&provider, &self.identity.signer, &key_packages)?;
            group.merge_pending_commit(&provider)?;
            welcome_bytes = Some(welcome.tls_serialize_detached()?);
        }

        self.refresh_exporter_secret(&group_id, &group)?;
        let epoch = group.epoch().as_u64();
        debug!(group = %group_id, epoch, "created group");

        self.groups_write()?.insert(group_id.clone(), group);
        self.storage.persist()?;
        Ok(CreatedGroup {
            group_id,
            epoch,
            welcome: welcome_bytes,
        })
    }

    fn preview_welcome(&self, welcome: &[u8]) -> Result<WelcomePreview, MlsEngineError> {
        let provider = self.make_provider();
        let (checked, _refs) = self.checked_welcome(welcome)?;
        let config = MlsGroupJoinConfig::builder().build();
        let processed = ProcessedWelcome::new_from_welcome(&provider, &config, checked)?;
        let group_id =
            GroupId::from_slice(processed.unverified_group_info().group_id().as_slice());

        // Already a member: answer from the live group rather than staging
        // a second copy over its stored state.
        self.ensure_group_loaded(&group_id)?;
        if let Some(group) = self.groups_read()?.get(&group_id) {
            return Ok(WelcomePreview {
                group_id: group_id.clone(),
                descriptor: Self::descriptor_from_group(group)?,
                epoch: group.epoch().as_u64(),
            });
        }

        // Unknown group: stage the join far enough to read the metadata,
        // then discard the provisional group state.
        let staged = processed.into_staged_welcome(&provider, None)?;
        let mut group = staged.into_group(&provider)?;
        let preview = WelcomePreview {
            group_id,
            descriptor: Self::descriptor_from_group(&group)?,
            epoch: group.epoch().as_u64(),
        };
        group
            .delete(provider.storage())
            .map_err(|e| EngineStorageError::Backend(e.to_string()))?;
        Ok(preview)
    }

    fn join_from_welcome(&self, welcome: &[u8]) -> Result<JoinedGroup, MlsEngineError> {
        let provider = self.make_provider();
        let (staged, used_refs) = self.staged_welcome(welcome)?;
        let group = staged.into_group(&provider)?;
        for hash_ref in &used_refs {
            self.storage.remove_key_package_ref(hash_ref)?;
        }

        let group_id = GroupId::from_slice(group.group_id().as_slice());
        let descriptor = Self::descriptor_from_group(&group)?;
        let epoch = group.epoch().as_u64();
        let members = Self::member_pubkeys(&group);

        self.refresh_exporter_secret(&group_id, &group)?;
        debug!(group = %group_id, epoch, "joined group from welcome");

        self.groups_write()?.insert(group_id.clone(), group);
        self.storage.persist()?;
        Ok(JoinedGroup {
            group_id,
            descriptor,
            epoch,
            members,
        })
    }

    fn add_members(
        &self,
        group_id: &GroupId,
        key_packages: &[Vec<u8>],
    ) -> Result<EngineCommit, MlsEngineError> {
        let parsed = key_packages
            .iter()
            .map(|bytes| self.parse_key_package(bytes))
            .collect::<Result<Vec<_>, _>>()?;

        let provider = self.make_provider();
        self.ensure_group_loaded(group_id)?;
        let mut groups = self.groups_write()?;
        let group = groups
            .get_mut(group_id)
            .ok_or_else(|| MlsEngineError::GroupNotFound(group_id.clone()))?;

        // The commit is sent under the epoch it was created in.
        let (send_epoch, send_secret) = self.refresh_exporter_secret(group_id, group)?;

        let (commit, welcome, _info) =
            group.add_members(&provider, &self.identity.signer, &parsed)?;
        group.merge_pending_commit(&provider)?;
        self.refresh_exporter_secret(group_id, group)?;
        self.storage.persist()?;

        Ok(EngineCommit {
            commit_wire: Self::frame_for_wire(send_epoch, &send_secret, &commit.to_bytes()?)?,
            welcome: Some(welcome.tls_serialize_detached()?),
            new_epoch: group.epoch().as_u64(),
        })
    }

    fn remove_members(
        &self,
        group_id: &GroupId,
        members: &[PublicKey],
    ) -> Result<EngineCommit, MlsEngineError> {
        let provider = self.make_provider();
        self.ensure_group_loaded(group_id)?;
        let mut groups = self.groups_write()?;
        let group = groups
            .get_mut(group_id)
            .ok_or_else(|| MlsEngineError::GroupNotFound(group_id.clone()))?;

        let indices: Vec<LeafNodeIndex> = group
            .members()
            .filter(|m| {
                members
                    .iter()
                    .any(|pk| m.credential.serialized_content() == pk.to_bytes().as_slice())
            })
            .map(|m| m.index)
            .collect();

        let (send_epoch, send_secret) = self.refresh_exporter_secret(group_id, group)?;

        let (commit, _welcome, _info) =
            group.remove_members(&provider, &self.identity.signer, &indices)?;
        group.merge_pending_commit(&provider)?;
        self.refresh_exporter_secret(group_id, group)?;
        self.storage.persist()?;

        Ok(EngineCommit {
            commit_wire: Self::frame_for_wire(send_epoch, &send_secret, &commit.to_bytes()?)?,
            welcome: None,
            new_epoch: group.epoch().as_u64(),
        })
    }

    fn encrypt_message(
        &self,
        group_id: &GroupId,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, MlsEngineError> {
        let provider = self.make_provider();
        self.ensure_group_loaded(group_id)?;
        let mut groups = self.groups_write()?;
        let group = groups
            .get_mut(group_id)
            .ok_or_else(|| MlsEngineError::GroupNotFound(group_id.clone()))?;

        let (epoch, secret) = self.refresh_exporter_secret(group_id, group)?;
        let message = group.create_message(&provider, &self.identity.signer, plaintext)?;
        let frame = Self::frame_for_wire(epoch, &secret, &message.to_bytes()?)?;
        self.storage.persist()?;
        Ok(frame)
    }

    fn process_wire_message(
        &self,
        group_id: &GroupId,
        wire: &[u8],
    ) -> Result<EngineOutput, MlsEngineError> {
        let provider = self.make_provider();
        self.ensure_group_loaded(group_id)?;
        let mut groups = self.groups_write()?;
        let group = groups
            .get_mut(group_id)
            .ok_or_else(|| MlsEngineError::GroupNotFound(group_id.clone()))?;

        let mls_bytes = self.unframe_from_wire(group_id, group, wire)?;

        let (mls_message, _) = MlsMessageIn::tls_deserialize_bytes(&mls_bytes)?;
        let protocol_message: ProtocolMessage = mls_message
            .try_into_protocol_message()
            .map_err(|_| MlsEngineError::UnexpectedMessageType)?;

        if protocol_message.group_id().as_slice() != group.group_id().as_slice() {
            debug!(group = %group_id, "ignoring message for different group");
            return Ok(EngineOutput::Ignored);
        }

        let processed = group.process_message(&provider, protocol_message)?;
        let sender_pubkey: Option<PublicKey> = processed
            .credential()
            .serialized_content()
            .try_into()
            .ok()
            .map(|bytes: [u8; 32]| PublicKey::from_bytes(&bytes));

        let output = match processed.into_content() {
            ProcessedMessageContent::ApplicationMessage(app) => {
                EngineOutput::ApplicationMessage(app.into_bytes())
            }
            ProcessedMessageContent::ProposalMessage(proposal) => {
                group
                    .store_pending_proposal(provider.storage(), proposal.as_ref().clone())
                    .map_err(|e| EngineStorageError::Backend(e.to_string()))?;
                EngineOutput::ProposalStored
            }
            ProcessedMessageContent::StagedCommitMessage(staged) => {
                // Membership changes are admin authority; a commit signed by
                // a non-admin member is rejected before merging.
                let descriptor = Self::descriptor_from_group(group)?;
                match &sender_pubkey {
                    Some(sender) if descriptor.is_admin(sender) => {}
                    Some(sender) => {
                        return Err(MlsEngineError::UnauthorizedCommit {
                            sender: sender.clone(),
                        });
                    }
                    None => return Err(MlsEngineError::MissingGroupData),
                }

                let removed = staged.self_removed();
                group.merge_staged_commit(&provider, *staged)?;
                let new_epoch = group.epoch().as_u64();
                self.refresh_exporter_secret(group_id, group)?;
                if removed {
                    EngineOutput::Removed { new_epoch }
                } else {
                    EngineOutput::CommitApplied { new_epoch }
                }
            }
            ProcessedMessageContent::ExternalJoinProposalMessage(_) => EngineOutput::Ignored,
        };
        self.storage.persist()?;
        Ok(output)
    }

    fn generate_key_package(&self) -> Result<KeyPackageMaterial, MlsEngineError> {
        let provider = self.make_provider();

        let bundle = KeyPackage::builder()
            .leaf_node_capabilities(Self::capabilities())
            .build(
                CIPHERSUITE,
                &provider,
                &self.identity.signer,
                self.identity.credential.clone(),
            )?;

        let kp = bundle.key_package();
        let hash_ref = kp.hash_ref(provider.crypto())?.as_slice().to_vec();
        let bytes = kp.tls_serialize_detached()?;

        self.storage.store_key_package_ref(&hash_ref)?;
        self.storage.persist()?;
        Ok(KeyPackageMaterial { bytes, hash_ref })
    }

    fn export_secret(&self, group_id: &GroupId) -> Result<[u8; 32], MlsEngineError> {
        self.ensure_group_loaded(group_id)?;
        let groups = self.groups_read()?;
        let group = groups
            .get(group_id)
            .ok_or_else(|| MlsEngineError::GroupNotFound(group_id.clone()))?;
        Ok(self.refresh_exporter_secret(group_id, group)?.1)
    }

    fn current_epoch(&self, group_id: &GroupId) -> Result<u64, MlsEngineError> {
        self.ensure_group_loaded(group_id)?;
        let groups = self.groups_read()?;
        let group = groups
            .get(group_id)
            .ok_or_else(|| MlsEngineError::GroupNotFound(group_id.clone()))?;
        Ok(group.epoch().as_u64())
    }

    fn members(&self, group_id: &GroupId) -> Result<Vec<PublicKey>, MlsEngineError> {
        self.ensure_group_loaded(group_id)?;
        let groups = self.groups_read()?;
        let group = groups
            .get(group_id)
            .ok_or_else(|| MlsEngineError::GroupNotFound(group_id.clone()))?;
        Ok(Self::member_pubkeys(group))
    }

    fn descriptor(&self, group_id: &GroupId) -> Result<GroupDescriptor, MlsEngineError> {
        self.ensure_group_loaded(group_id)?;
        let groups = self.groups_read()?;
        let group = groups
            .get(group_id)
            .ok_or_else(|| MlsEngineError::GroupNotFound(group_id.clone()))?;
        Self::descriptor_from_group(group)
    }

    fn wipe(&self) {
        if let Ok(mut groups) = self.groups.write() {
            groups.clear();
        }
        self.storage.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::engine::GroupCryptoEngine;
    use super::super::storage::SqliteEngineStorage;
    use super::*;
    use crate::store::Store;
    use crate::types::GroupType;

    fn engine_over(store: Arc<Store>, account: PublicKey) -> MlsEngine<SqliteEngineStorage> {
        let storage = SqliteEngineStorage::open(store, account.clone()).unwrap();
        MlsEngine::new(storage, account).unwrap()
    }

    fn descriptor(admin: &PublicKey) -> GroupDescriptor {
        GroupDescriptor {
            name: "durable".into(),
            description: String::new(),
            admins: vec![admin.clone()],
            relays: vec!["wss://relay.example".into()],
            transport_group_id: hex::encode([0xAB; 32]),
            group_type: GroupType::Group,
        }
    }

    #[test]
    fn group_state_survives_engine_restart() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let account = PublicKey::from_bytes(&[5u8; 32]);
        store.insert_account(&account).unwrap();

        let engine = engine_over(store.clone(), account.clone());
        let created = engine.create_group(&descriptor(&account), &[]).unwrap();
        engine
            .encrypt_message(&created.group_id, b"before restart")
            .unwrap();
        drop(engine);

        let engine = engine_over(store, account);
        assert_eq!(
            engine.current_epoch(&created.group_id).unwrap(),
            created.epoch
        );
        assert_eq!(engine.descriptor(&created.group_id).unwrap().name, "durable");
        assert_eq!(engine.members(&created.group_id).unwrap().len(), 1);
        engine
            .encrypt_message(&created.group_id, b"after restart")
            .unwrap();
    }

    #[test]
    fn key_package_ref_survives_engine_restart() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let account = PublicKey::from_bytes(&[6u8; 32]);
        store.insert_account(&account).unwrap();

        let engine = engine_over(store.clone(), account.clone());
        let material = engine.generate_key_package().unwrap();
        drop(engine);

        let engine = engine_over(store, account);
        assert!(engine
            .storage
            .is_our_key_package(&material.hash_ref)
            .unwrap());
    }
}
