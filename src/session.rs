//! Account and session management.
//!
//! "Which account is active" is not a mutable global: each activation
//! builds a fresh [`SessionContext`] (keys plus a new crypto engine) and
//! every operation takes the context it was started with. The manager is
//! the sole writer of the current context, and switching is a critical
//! section serialized by the async mutex. The client stops the dispatch
//! worker and waits for it before calling in, so no event processing
//! straddles a switch.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crate::error::{CoreError, Result};
use crate::events::{LifecycleEvent, Notifier};
use crate::mls::{GroupCryptoEngine, MlsEngineError};
use crate::store::models::Account;
use crate::store::Store;
use crate::types::PublicKey;
use crate::wire::AccountKeys;

/// Builds a fresh crypto engine for an identity. Production wires in
/// [`MlsEngine`](crate::mls::MlsEngine); tests substitute a scripted one.
pub type EngineFactory = Box<
    dyn Fn(&AccountKeys) -> std::result::Result<Arc<dyn GroupCryptoEngine>, MlsEngineError>
        + Send
        + Sync,
>;

/// Everything an operation needs from "the active account".
pub struct SessionContext {
    pub account: PublicKey,
    pub keys: AccountKeys,
    pub engine: Arc<dyn GroupCryptoEngine>,
}

pub struct SessionManager {
    store: Arc<Store>,
    notifier: Notifier,
    engine_factory: EngineFactory,
    current: Mutex<Option<Arc<SessionContext>>>,
}

impl SessionManager {
    pub fn new(store: Arc<Store>, notifier: Notifier, engine_factory: EngineFactory) -> Self {
        Self {
            store,
            notifier,
            engine_factory,
            current: Mutex::new(None),
        }
    }

    pub fn list_accounts(&self) -> Result<Vec<Account>> {
        Ok(self.store.list_accounts()?)
    }

    /// The current session context, if any account is active.
    pub async fn current(&self) -> Option<Arc<SessionContext>> {
        self.current.lock().await.clone()
    }

    /// The current session context, or `NoActiveSession`.
    pub async fn require_current(&self) -> Result<Arc<SessionContext>> {
        self.current().await.ok_or(CoreError::NoActiveSession)
    }

    /// Activate an existing account. Tears down the previous context and
    /// builds a new one; fails `NotFound` for unknown accounts or accounts
    /// without stored signing material.
    pub async fn set_active(&self, pubkey: &PublicKey) -> Result<Account> {
        let mut current = self.current.lock().await;

        if self.store.get_account(pubkey)?.is_none() {
            return Err(CoreError::not_found(format!("account {pubkey}")));
        }
        let secret = self
            .store
            .account_secret(pubkey)?
            .ok_or_else(|| CoreError::not_found(format!("signing material for {pubkey}")))?;
        let keys = AccountKeys::from_secret_hex(&secret)?;

        self.install(&mut current, keys).await
    }

    /// Generate a fresh identity, persist it, and activate it.
    pub async fn create(&self) -> Result<Account> {
        let mut current = self.current.lock().await;
        let keys = AccountKeys::generate();
        self.store.insert_account(keys.public_key())?;
        self.store
            .store_account_secret(keys.public_key(), &keys.secret_hex())?;
        self.install(&mut current, keys).await
    }

    /// Import an identity from raw secret material and activate it.
    /// Re-importing a known secret is an activation, not a duplicate.
    pub async fn import_and_activate(&self, secret_hex: &str) -> Result<Account> {
        let mut current = self.current.lock().await;
        let keys = AccountKeys::from_secret_hex(secret_hex)?;
        self.store.insert_account(keys.public_key())?;
        self.store
            .store_account_secret(keys.public_key(), &keys.secret_hex())?;
        self.install(&mut current, keys).await
    }

    async fn install(
        &self,
        current: &mut Option<Arc<SessionContext>>,
        keys: AccountKeys,
    ) -> Result<Account> {
        if let Some(previous) = current.take() {
            previous.engine.wipe();
        }

        let pubkey = keys.public_key().clone();
        let engine = (self.engine_factory)(&keys)?;
        let account = self.store.set_active_account(&pubkey)?;

        *current = Some(Arc::new(SessionContext {
            account: pubkey.clone(),
            keys,
            engine,
        }));

        info!(account = %pubkey, "session activated");
        self.notifier.emit(LifecycleEvent::AccountChanged {
            account: pubkey.clone(),
        });
        self.notifier
            .emit(LifecycleEvent::SessionReady { account: pubkey });
        Ok(account)
    }

    /// Remove an account and its data. If it was the active one, the
    /// session is cleared and no account is left active.
    pub async fn logout(&self, pubkey: &PublicKey) -> Result<()> {
        let mut current = self.current.lock().await;

        if self.store.get_account(pubkey)?.is_none() {
            return Err(CoreError::not_found(format!("account {pubkey}")));
        }

        let was_active = current
            .as_ref()
            .map(|ctx| &ctx.account == pubkey)
            .unwrap_or(false);
        if was_active {
            if let Some(ctx) = current.take() {
                ctx.engine.wipe();
            }
        }

        self.store.delete_account(pubkey)?;
        info!(account = %pubkey, "account removed");
        if was_active {
            self.notifier.emit(LifecycleEvent::SessionCleared);
        }
        Ok(())
    }

    /// Drop the current context without deleting anything.
    pub async fn clear(&self) -> Result<()> {
        let mut current = self.current.lock().await;
        if let Some(ctx) = current.take() {
            ctx.engine.wipe();
            self.store.clear_active_account()?;
            self.notifier.emit(LifecycleEvent::SessionCleared);
        }
        Ok(())
    }
}
