//! Group crypto engine boundary and its MLS implementation.
//!
//! The rest of the crate talks to [`GroupCryptoEngine`], a trait covering
//! exactly the cryptographic operations the session engine needs: group
//! creation, welcome admission, membership commits, message encryption and
//! decryption, key package generation, and secret export. [`MlsEngine`]
//! implements it with OpenMLS.
//!
//! The engine's in-memory group state is a cache; the store's Group row is
//! authoritative for dedup and ordering decisions. The engine's own epoch
//! remains the cryptographic ground truth and the two are reconciled after
//! every applied commit.

mod engine;
mod error;
mod service;
pub mod storage;
mod types;

pub use engine::GroupCryptoEngine;
pub use error::{EngineStorageError, MlsEngineError};
pub use service::{MlsEngine, CIPHERSUITE, GROUP_DATA_EXTENSION_TYPE};
pub use storage::{EngineStorage, MemoryEngineStorage, SqliteEngineStorage};
pub use types::{
    CreatedGroup, EngineCommit, EngineOutput, GroupDescriptor, JoinedGroup, KeyPackageMaterial,
    WelcomePreview,
};
