//! Storage abstraction for engine-side persistence.
//!
//! The engine needs four things from its backend: delegation to an OpenMLS
//! storage provider, the account's serialized signing identity, tracking of
//! our own key package references (to recognize welcomes addressed to us),
//! and a small cache of per-group exporter secrets for the wire layer.
//! Durable backends snapshot all of it into one blob per account so group
//! state survives a restart.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use openmls_rust_crypto::MemoryStorage;
use serde::{Deserialize, Serialize};

use super::error::EngineStorageError;
use crate::store::Store;
use crate::types::{GroupId, PublicKey};

/// Engine storage backend.
///
/// Implementations must be `Send + Sync`; internal synchronization is the
/// implementation's responsibility.
pub trait EngineStorage: Send + Sync + 'static {
    /// The OpenMLS storage provider type.
    /// VERSION is the OpenMLS storage version (currently 1).
    type MlsStorage: openmls_traits::storage::StorageProvider<1, Error = Self::StorageError>;

    /// Storage error type (must be compatible with OpenMLS).
    type StorageError: std::error::Error + Send + Sync + 'static;

    /// Store the account's serialized MLS signing identity.
    fn store_identity(&self, bytes: &[u8]) -> Result<(), EngineStorageError>;

    /// Load the serialized signing identity, if one was stored.
    fn identity(&self) -> Result<Option<Vec<u8>>, EngineStorageError>;

    /// Store a key package hash reference as ours.
    fn store_key_package_ref(&self, hash_ref: &[u8]) -> Result<(), EngineStorageError>;

    /// Check whether a key package hash reference belongs to us.
    fn is_our_key_package(&self, hash_ref: &[u8]) -> Result<bool, EngineStorageError>;

    /// Remove a key package reference after it was consumed by a welcome.
    fn remove_key_package_ref(&self, hash_ref: &[u8]) -> Result<(), EngineStorageError>;

    /// Cache the exporter secret for a group epoch, replacing older epochs.
    fn store_exporter_secret(
        &self,
        group: &GroupId,
        epoch: u64,
        secret: [u8; 32],
    ) -> Result<(), EngineStorageError>;

    /// Look up the cached exporter secret for a group epoch.
    fn exporter_secret(
        &self,
        group: &GroupId,
        epoch: u64,
    ) -> Result<Option<[u8; 32]>, EngineStorageError>;

    /// Flush the current state to the durable backend, if there is one.
    fn persist(&self) -> Result<(), EngineStorageError>;

    /// Drop all in-memory state (logout / account switch). Durable state
    /// stays put so the account can be reactivated later.
    fn clear(&self);

    /// Get the OpenMLS storage provider.
    fn mls_storage(&self) -> &Self::MlsStorage;
}

/// Serialized engine state: signing identity, key package refs, exporter
/// secrets, and the raw OpenMLS key/value entries.
#[derive(Serialize, Deserialize)]
struct EngineSnapshot {
    identity: Option<Vec<u8>>,
    key_package_refs: Vec<Vec<u8>>,
    exporter_secrets: Vec<(GroupId, u64, [u8; 32])>,
    mls_entries: Vec<(Vec<u8>, Vec<u8>)>,
}

/// In-memory engine storage. Everything is lost on drop; used in tests and
/// as the resident half of [`SqliteEngineStorage`].
#[derive(Default)]
pub struct MemoryEngineStorage {
    identity: RwLock<Option<Vec<u8>>>,
    key_package_refs: RwLock<HashSet<Vec<u8>>>,
    exporter_secrets: RwLock<HashMap<GroupId, (u64, [u8; 32])>>,
    mls: MemoryStorage,
}

impl MemoryEngineStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> Result<EngineSnapshot, EngineStorageError> {
        let identity = self
            .identity
            .read()
            .map_err(|e| EngineStorageError::Lock(e.to_string()))?
            .clone();
        let key_package_refs = self
            .key_package_refs
            .read()
            .map_err(|e| EngineStorageError::Lock(e.to_string()))?
            .iter()
            .cloned()
            .collect();
        let exporter_secrets = self
            .exporter_secrets
            .read()
            .map_err(|e| EngineStorageError::Lock(e.to_string()))?
            .iter()
            .map(|(group, (epoch, secret))| (group.clone(), *epoch, *secret))
            .collect();
        let mls_entries = self
            .mls
            .values
            .read()
            .map_err(|e| EngineStorageError::Lock(e.to_string()))?
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(EngineSnapshot {
            identity,
            key_package_refs,
            exporter_secrets,
            mls_entries,
        })
    }

    fn restore(snapshot: EngineSnapshot) -> Result<Self, EngineStorageError> {
        let storage = Self::default();
        *storage
            .identity
            .write()
            .map_err(|e| EngineStorageError::Lock(e.to_string()))? = snapshot.identity;
        *storage
            .key_package_refs
            .write()
            .map_err(|e| EngineStorageError::Lock(e.to_string()))? =
            snapshot.key_package_refs.into_iter().collect();
        *storage
            .exporter_secrets
            .write()
            .map_err(|e| EngineStorageError::Lock(e.to_string()))? = snapshot
            .exporter_secrets
            .into_iter()
            .map(|(group, epoch, secret)| (group, (epoch, secret)))
            .collect();
        *storage
            .mls
            .values
            .write()
            .map_err(|e| EngineStorageError::Lock(e.to_string()))? =
            snapshot.mls_entries.into_iter().collect();
        Ok(storage)
    }
}

impl EngineStorage for MemoryEngineStorage {
    type MlsStorage = MemoryStorage;
    type StorageError = openmls_rust_crypto::MemoryStorageError;

    fn store_identity(&self, bytes: &[u8]) -> Result<(), EngineStorageError> {
        *self
            .identity
            .write()
            .map_err(|e| EngineStorageError::Lock(e.to_string()))? = Some(bytes.to_vec());
        Ok(())
    }

    fn identity(&self) -> Result<Option<Vec<u8>>, EngineStorageError> {
        Ok(self
            .identity
            .read()
            .map_err(|e| EngineStorageError::Lock(e.to_string()))?
            .clone())
    }

    fn store_key_package_ref(&self, hash_ref: &[u8]) -> Result<(), EngineStorageError> {
        self.key_package_refs
            .write()
            .map_err(|e| EngineStorageError::Lock(e.to_string()))?
            .insert(hash_ref.to_vec());
        Ok(())
    }

    fn is_our_key_package(&self, hash_ref: &[u8]) -> Result<bool, EngineStorageError> {
        Ok(self
            .key_package_refs
            .read()
            .map_err(|e| EngineStorageError::Lock(e.to_string()))?
            .contains(hash_ref))
    }

    fn remove_key_package_ref(&self, hash_ref: &[u8]) -> Result<(), EngineStorageError> {
        self.key_package_refs
            .write()
            .map_err(|e| EngineStorageError::Lock(e.to_string()))?
            .remove(hash_ref);
        Ok(())
    }

    fn store_exporter_secret(
        &self,
        group: &GroupId,
        epoch: u64,
        secret: [u8; 32],
    ) -> Result<(), EngineStorageError> {
        self.exporter_secrets
            .write()
            .map_err(|e| EngineStorageError::Lock(e.to_string()))?
            .insert(group.clone(), (epoch, secret));
        Ok(())
    }

    fn exporter_secret(
        &self,
        group: &GroupId,
        epoch: u64,
    ) -> Result<Option<[u8; 32]>, EngineStorageError> {
        Ok(self
            .exporter_secrets
            .read()
            .map_err(|e| EngineStorageError::Lock(e.to_string()))?
            .get(group)
            .filter(|(e, _)| *e == epoch)
            .map(|(_, s)| *s))
    }

    fn persist(&self) -> Result<(), EngineStorageError> {
        Ok(())
    }

    fn clear(&self) {
        if let Ok(mut identity) = self.identity.write() {
            *identity = None;
        }
        if let Ok(mut refs) = self.key_package_refs.write() {
            refs.clear();
        }
        if let Ok(mut secrets) = self.exporter_secrets.write() {
            secrets.clear();
        }
        if let Ok(mut values) = self.mls.values.write() {
            values.clear();
        }
    }

    fn mls_storage(&self) -> &Self::MlsStorage {
        &self.mls
    }
}

/// Engine storage backed by the relational store.
///
/// State is held in memory and snapshotted into the `engine_state` table on
/// [`EngineStorage::persist`]. [`EngineStorage::clear`] drops only the
/// resident copy; the blob stays until the account itself is deleted, so a
/// reactivated account reloads its groups.
pub struct SqliteEngineStorage {
    inner: MemoryEngineStorage,
    store: Arc<Store>,
    account: PublicKey,
}

impl SqliteEngineStorage {
    pub fn open(store: Arc<Store>, account: PublicKey) -> Result<Self, EngineStorageError> {
        let inner = match store
            .engine_state(&account)
            .map_err(|e| EngineStorageError::Backend(e.to_string()))?
        {
            Some(blob) => {
                let snapshot: EngineSnapshot = serde_json::from_slice(&blob)
                    .map_err(|e| EngineStorageError::Backend(e.to_string()))?;
                MemoryEngineStorage::restore(snapshot)?
            }
            None => MemoryEngineStorage::new(),
        };
        Ok(Self {
            inner,
            store,
            account,
        })
    }
}

impl EngineStorage for SqliteEngineStorage {
    type MlsStorage = MemoryStorage;
    type StorageError = openmls_rust_crypto::MemoryStorageError;

    fn store_identity(&self, bytes: &[u8]) -> Result<(), EngineStorageError> {
        self.inner.store_identity(bytes)
    }

    fn identity(&self) -> Result<Option<Vec<u8>>, EngineStorageError> {
        self.inner.identity()
    }

    fn store_key_package_ref(&self, hash_ref: &[u8]) -> Result<(), EngineStorageError> {
        self.inner.store_key_package_ref(hash_ref)
    }

    fn is_our_key_package(&self, hash_ref: &[u8]) -> Result<bool, EngineStorageError> {
        self.inner.is_our_key_package(hash_ref)
    }

    fn remove_key_package_ref(&self, hash_ref: &[u8]) -> Result<(), EngineStorageError> {
        self.inner.remove_key_package_ref(hash_ref)
    }

    fn store_exporter_secret(
        &self,
        group: &GroupId,
        epoch: u64,
        secret: [u8; 32],
    ) -> Result<(), EngineStorageError> {
        self.inner.store_exporter_secret(group, epoch, secret)
    }

    fn exporter_secret(
        &self,
        group: &GroupId,
        epoch: u64,
    ) -> Result<Option<[u8; 32]>, EngineStorageError> {
        self.inner.exporter_secret(group, epoch)
    }

    fn persist(&self) -> Result<(), EngineStorageError> {
        let snapshot = self.inner.snapshot()?;
        let blob = serde_json::to_vec(&snapshot)
            .map_err(|e| EngineStorageError::Backend(e.to_string()))?;
        self.store
            .save_engine_state(&self.account, &blob)
            .map_err(|e| EngineStorageError::Backend(e.to_string()))
    }

    fn clear(&self) {
        self.inner.clear();
    }

    fn mls_storage(&self) -> &Self::MlsStorage {
        self.inner.mls_storage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PublicKey;

    #[test]
    fn key_package_refs_round_trip() {
        let storage = MemoryEngineStorage::new();
        assert!(!storage.is_our_key_package(b"ref-1").unwrap());

        storage.store_key_package_ref(b"ref-1").unwrap();
        assert!(storage.is_our_key_package(b"ref-1").unwrap());

        storage.remove_key_package_ref(b"ref-1").unwrap();
        assert!(!storage.is_our_key_package(b"ref-1").unwrap());
    }

    #[test]
    fn exporter_secret_keeps_only_latest_epoch() {
        let storage = MemoryEngineStorage::new();
        let group = GroupId::from_slice(b"g1");

        storage.store_exporter_secret(&group, 3, [3u8; 32]).unwrap();
        storage.store_exporter_secret(&group, 4, [4u8; 32]).unwrap();

        assert_eq!(storage.exporter_secret(&group, 4).unwrap(), Some([4u8; 32]));
        assert_eq!(storage.exporter_secret(&group, 3).unwrap(), None);
    }

    #[test]
    fn sqlite_backend_survives_reopen_and_clear() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let account = PublicKey::from_bytes(&[7u8; 32]);
        store.insert_account(&account).unwrap();

        let group = GroupId::from_slice(b"g1");
        let storage = SqliteEngineStorage::open(store.clone(), account.clone()).unwrap();
        storage.store_identity(b"id-bytes").unwrap();
        storage.store_key_package_ref(b"ref-1").unwrap();
        storage.store_exporter_secret(&group, 2, [2u8; 32]).unwrap();
        storage.persist().unwrap();

        // clear() drops the resident copy only.
        storage.clear();
        assert!(storage.identity().unwrap().is_none());

        let reopened = SqliteEngineStorage::open(store, account).unwrap();
        assert_eq!(reopened.identity().unwrap().as_deref(), Some(&b"id-bytes"[..]));
        assert!(reopened.is_our_key_package(b"ref-1").unwrap());
        assert_eq!(reopened.exporter_secret(&group, 2).unwrap(), Some([2u8; 32]));
    }
}
