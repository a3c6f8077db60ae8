//! The crate's command surface.
//!
//! [`Covey`] owns the store, the session manager, the processors, and the
//! gateway handle, and exposes the operations a presentation layer drives:
//! account lifecycle, group creation and membership, invite resolution,
//! messaging, key package publication, and data wipe. Every mutating
//! operation emits the matching [`LifecycleEvent`](crate::events::LifecycleEvent).

use std::path::Path;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::dispatch::Dispatcher;
use crate::error::{CoreError, Result};
use crate::events::{LifecycleEvent, Notifier};
use crate::gateway::{EventFilter, PublishReceipt, RelayGateway};
use crate::invites::InviteProcessor;
use crate::key_packages::{KeyPackagePublisher, Receipt};
use crate::messages::MessageProcessor;
use crate::mls::{GroupDescriptor, MlsEngine, SqliteEngineStorage};
use crate::session::{EngineFactory, SessionContext, SessionManager};
use crate::store::models::{
    Account, AccountMetadata, Group, Invite, InviteState, Message, Relay,
};
use crate::store::Store;
use crate::types::{
    kind, EventId, GroupId, GroupState, GroupType, PublicKey, RelayPurpose, Rumor, Timestamp,
};
use crate::wire;

const DB_FILE: &str = "covey.db";

/// Profile plus capability flags for one contact, answering "can I invite
/// this person right now".
#[derive(Clone, Debug)]
pub struct EnrichedContact {
    pub pubkey: PublicKey,
    pub metadata: Option<AccountMetadata>,
    pub has_key_package: bool,
    pub has_inbox_relays: bool,
}

pub struct Covey {
    store: Arc<Store>,
    notifier: Notifier,
    gateway: Arc<dyn RelayGateway>,
    sessions: SessionManager,
    invites: Arc<InviteProcessor>,
    messages: Arc<MessageProcessor>,
    key_packages: KeyPackagePublisher,
    dispatcher: Arc<Dispatcher>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Covey {
    /// Open (or create) the database under `data_dir` and wire the default
    /// OpenMLS engine, persisted through the same store.
    pub fn open(data_dir: &Path, gateway: Arc<dyn RelayGateway>) -> Result<Self> {
        let store = Arc::new(Store::open(&data_dir.join(DB_FILE))?);
        let engine_store = store.clone();
        let factory: EngineFactory = Box::new(move |keys| {
            let storage =
                SqliteEngineStorage::open(engine_store.clone(), keys.public_key().clone())?;
            let engine = MlsEngine::new(storage, keys.public_key().clone())?;
            Ok(Arc::new(engine))
        });
        Ok(Self::assemble(store, gateway, factory))
    }

    /// As [`open`](Self::open), but with a caller-supplied engine factory.
    pub fn open_with_engine_factory(
        data_dir: &Path,
        gateway: Arc<dyn RelayGateway>,
        engine_factory: EngineFactory,
    ) -> Result<Self> {
        let store = Arc::new(Store::open(&data_dir.join(DB_FILE))?);
        Ok(Self::assemble(store, gateway, engine_factory))
    }

    fn assemble(
        store: Arc<Store>,
        gateway: Arc<dyn RelayGateway>,
        engine_factory: EngineFactory,
    ) -> Self {
        let notifier = Notifier::new();
        let sessions = SessionManager::new(store.clone(), notifier.clone(), engine_factory);
        let invites = Arc::new(InviteProcessor::new(store.clone(), notifier.clone()));
        let messages = Arc::new(MessageProcessor::new(store.clone(), notifier.clone()));
        let key_packages = KeyPackagePublisher::new(store.clone(), gateway.clone());
        let dispatcher = Arc::new(Dispatcher::new(invites.clone(), messages.clone()));
        Self {
            store,
            notifier,
            gateway,
            sessions,
            invites,
            messages,
            key_packages,
            dispatcher,
            worker: tokio::sync::Mutex::new(None),
        }
    }

    /// Subscribe to lifecycle notifications.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<LifecycleEvent> {
        self.notifier.subscribe()
    }

    // --- accounts ---

    pub fn list_accounts(&self) -> Result<Vec<Account>> {
        self.sessions.list_accounts()
    }

    pub async fn create_account(&self) -> Result<Account> {
        self.stop_worker().await;
        let account = self.sessions.create().await?;
        self.start_worker().await?;
        Ok(account)
    }

    pub async fn import_account(&self, secret_hex: &str) -> Result<Account> {
        self.stop_worker().await;
        let account = self.sessions.import_and_activate(secret_hex).await?;
        self.start_worker().await?;
        Ok(account)
    }

    pub async fn set_active_account(&self, pubkey: &PublicKey) -> Result<Account> {
        self.stop_worker().await;
        let account = self.sessions.set_active(pubkey).await?;
        self.start_worker().await?;
        Ok(account)
    }

    pub async fn logout(&self, pubkey: &PublicKey) -> Result<()> {
        let was_active =
            matches!(self.sessions.current().await, Some(ctx) if ctx.account == *pubkey);
        if was_active {
            self.stop_worker().await;
        }
        self.sessions.logout(pubkey).await?;
        Ok(())
    }

    /// Export the active account's raw secret as hex.
    pub async fn export_secret_key(&self) -> Result<String> {
        let ctx = self.sessions.current().await.ok_or(CoreError::NoActiveSession)?;
        Ok(ctx.keys.secret_hex())
    }

    async fn start_worker(&self) -> Result<()> {
        let ctx = self.sessions.require_current().await?;
        let inbox = self.gateway.subscribe();
        let mut worker = self.worker.lock().await;
        if let Some(old) = worker.take() {
            old.abort();
            let _ = old.await;
        }
        *worker = Some(self.dispatcher.clone().spawn(ctx, inbox));
        Ok(())
    }

    /// Abort the dispatch worker and wait for it to wind down. The worker
    /// awaits only between events, so an in-flight event finishes against
    /// the session it started with before the handle resolves.
    async fn stop_worker(&self) {
        let mut worker = self.worker.lock().await;
        if let Some(old) = worker.take() {
            old.abort();
            let _ = old.await;
        }
    }

    // --- groups ---

    pub async fn list_groups(&self) -> Result<Vec<Group>> {
        let ctx = self.sessions.require_current().await?;
        Ok(self.store.list_groups(&ctx.account)?)
    }

    pub async fn get_group(&self, group_id: &GroupId) -> Result<Group> {
        let ctx = self.sessions.require_current().await?;
        self.store
            .get_group(group_id, &ctx.account)?
            .ok_or_else(|| CoreError::not_found(format!("group {group_id}")))
    }

    /// Create a group with the given members, fetching one published key
    /// package per member and gift-wrapping a welcome to each.
    pub async fn create_group(
        &self,
        name: &str,
        description: &str,
        members: &[PublicKey],
        admins: &[PublicKey],
        relays: &[String],
    ) -> Result<Group> {
        let ctx = self.sessions.require_current().await?;
        let account = &ctx.account;

        let mut admin_set: Vec<PublicKey> = admins.to_vec();
        if !admin_set.contains(account) {
            admin_set.insert(0, account.clone());
        }

        let mut key_packages = Vec::with_capacity(members.len());
        for member in members {
            let mut published = self
                .key_packages
                .fetch_key_package_events(&ctx, member)
                .await?;
            let (_, bytes) = published.pop().ok_or_else(|| {
                CoreError::not_found(format!("no published key package for {member}"))
            })?;
            key_packages.push(bytes);
        }

        let mut transport_id = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut transport_id);
        let descriptor = GroupDescriptor {
            name: name.to_owned(),
            description: description.to_owned(),
            admins: admin_set,
            relays: relays.to_vec(),
            transport_group_id: hex::encode(transport_id),
            group_type: if members.len() == 1 {
                GroupType::DirectMessage
            } else {
                GroupType::Group
            },
        };

        let created = ctx.engine.create_group(&descriptor, &key_packages)?;
        let group = Group {
            mls_group_id: created.group_id.clone(),
            account_pubkey: account.clone(),
            nostr_group_id: descriptor.transport_group_id.clone(),
            name: descriptor.name.clone(),
            description: descriptor.description.clone(),
            admin_pubkeys: descriptor.admins.clone(),
            epoch: created.epoch,
            state: GroupState::Active,
            last_message_id: None,
            last_message_at: None,
            group_type: descriptor.group_type,
        };
        self.store.upsert_group(&group)?;
        let relay_rows: Vec<Relay> = relays
            .iter()
            .map(|url| Relay {
                url: url.clone(),
                purpose: RelayPurpose::ReadWrite,
            })
            .collect();
        self.store
            .replace_group_relays(&group.mls_group_id, account, &relay_rows)?;

        if let Some(welcome) = created.welcome {
            self.send_welcomes(&ctx, &welcome, members, relays, members.len() + 1)
                .await?;
        }

        info!(group = %group.mls_group_id, members = members.len(), "group created");
        self.notifier.emit(LifecycleEvent::GroupJoined {
            group: group.clone(),
        });
        Ok(group)
    }

    /// Gift-wrap the serialized welcome to each member and publish.
    async fn send_welcomes(
        &self,
        ctx: &SessionContext,
        welcome: &[u8],
        members: &[PublicKey],
        relays: &[String],
        member_count: usize,
    ) -> Result<()> {
        let rumor = Rumor::new(
            ctx.account.clone(),
            Timestamp::now(),
            kind::WELCOME,
            vec![vec!["members".into(), member_count.to_string()]],
            BASE64.encode(welcome),
        );
        for member in members {
            let wrap = wire::seal_gift(&rumor, member)?;
            let receipt = self.gateway.publish(relays, wrap).await?;
            if !receipt.is_success() {
                warn!(member = %member, "welcome not accepted by any relay");
            }
        }
        Ok(())
    }

    /// Add members to a group this account administers: fetch key packages,
    /// commit, publish the commit to the group, and welcome the newcomers.
    pub async fn add_group_members(
        &self,
        group_id: &GroupId,
        members: &[PublicKey],
    ) -> Result<Group> {
        let ctx = self.sessions.require_current().await?;
        let group = self.get_group(group_id).await?;
        if group.state != GroupState::Active {
            return Err(CoreError::invalid_input("group is inactive"));
        }

        let mut key_packages = Vec::with_capacity(members.len());
        for member in members {
            let mut published = self
                .key_packages
                .fetch_key_package_events(&ctx, member)
                .await?;
            let (_, bytes) = published.pop().ok_or_else(|| {
                CoreError::not_found(format!("no published key package for {member}"))
            })?;
            key_packages.push(bytes);
        }

        let commit = ctx.engine.add_members(group_id, &key_packages)?;
        let relays = self.group_relay_urls(&ctx, group_id)?;
        self.publish_commit(&group, &commit.commit_wire, &relays)
            .await?;
        if let Some(welcome) = &commit.welcome {
            let count = ctx.engine.members(group_id)?.len();
            self.send_welcomes(&ctx, welcome, members, &relays, count)
                .await?;
        }

        self.store
            .advance_group_epoch(group_id, &ctx.account, commit.new_epoch)?;
        info!(group = %group_id, new_epoch = commit.new_epoch, added = members.len(),
              "members added");
        self.get_group(group_id).await
    }

    /// Remove members from a group this account administers.
    pub async fn remove_group_members(
        &self,
        group_id: &GroupId,
        members: &[PublicKey],
    ) -> Result<Group> {
        let ctx = self.sessions.require_current().await?;
        let group = self.get_group(group_id).await?;
        if group.state != GroupState::Active {
            return Err(CoreError::invalid_input("group is inactive"));
        }

        let commit = ctx.engine.remove_members(group_id, members)?;
        let relays = self.group_relay_urls(&ctx, group_id)?;
        self.publish_commit(&group, &commit.commit_wire, &relays)
            .await?;

        self.store
            .advance_group_epoch(group_id, &ctx.account, commit.new_epoch)?;
        info!(group = %group_id, new_epoch = commit.new_epoch, removed = members.len(),
              "members removed");
        self.get_group(group_id).await
    }

    /// Administrative exception to the inactive rule: bring a group back.
    pub async fn reactivate_group(&self, group_id: &GroupId) -> Result<Group> {
        let ctx = self.sessions.require_current().await?;
        self.store
            .set_group_state(group_id, &ctx.account, GroupState::Active)?;
        self.get_group(group_id).await
    }

    async fn publish_commit(
        &self,
        group: &Group,
        commit_wire: &[u8],
        relays: &[String],
    ) -> Result<PublishReceipt> {
        let wrapper = crate::wire::AccountKeys::generate().sign_event(
            Timestamp::now(),
            kind::GROUP_MESSAGE,
            vec![vec!["h".into(), group.nostr_group_id.clone()]],
            BASE64.encode(commit_wire),
        );
        // Our engine already merged this commit; ledger the wrapper so the
        // echoed event is a no-op.
        self.store
            .record_message_commit(&wrapper.id, &group.account_pubkey)?;
        Ok(self.gateway.publish(relays, wrapper).await?)
    }

    fn group_relay_urls(&self, ctx: &SessionContext, group_id: &GroupId) -> Result<Vec<String>> {
        let urls: Vec<String> = self
            .store
            .group_relays(group_id, &ctx.account)?
            .into_iter()
            .map(|r| r.url)
            .collect();
        if urls.is_empty() {
            return Err(crate::gateway::GatewayError::NoRelays("group").into());
        }
        Ok(urls)
    }

    // --- invites ---

    pub async fn list_invites(&self, state: Option<InviteState>) -> Result<Vec<Invite>> {
        let ctx = self.sessions.require_current().await?;
        self.invites.list(&ctx.account, state)
    }

    pub async fn get_invite(&self, invite_id: &EventId) -> Result<Invite> {
        let ctx = self.sessions.require_current().await?;
        self.invites
            .get(&ctx.account, invite_id)?
            .ok_or_else(|| CoreError::not_found(format!("invite {invite_id}")))
    }

    pub async fn accept_invite(&self, invite_id: &EventId) -> Result<Group> {
        let ctx = self.sessions.require_current().await?;
        self.invites.accept(&ctx, invite_id).await
    }

    pub async fn decline_invite(&self, invite_id: &EventId) -> Result<Invite> {
        let ctx = self.sessions.require_current().await?;
        self.invites.decline(&ctx, invite_id).await
    }

    // --- messages ---

    pub async fn group_messages(&self, group_id: &GroupId) -> Result<Vec<Message>> {
        let ctx = self.sessions.require_current().await?;
        self.messages.list(&ctx.account, group_id)
    }

    pub async fn send_message(
        &self,
        group_id: &GroupId,
        content: String,
        tags: Vec<Vec<String>>,
    ) -> Result<Message> {
        let ctx = self.sessions.require_current().await?;
        let relays = self.group_relay_urls(&ctx, group_id)?;
        let (wrapper, message) = self
            .messages
            .prepare_send(&ctx, group_id, content, tags)
            .await?;
        let wrapper_id = wrapper.id.clone();

        // The transcript row was written optimistically; a send the relays
        // never took must not linger in it.
        let outcome: Result<()> = match self.gateway.publish(&relays, wrapper).await {
            Ok(receipt) if receipt.is_success() => Ok(()),
            Ok(_) => Err(crate::gateway::GatewayError::Publish(
                "no relay accepted the message".into(),
            )
            .into()),
            Err(err) => Err(err.into()),
        };
        if let Err(err) = outcome {
            self.store
                .forget_unpublished_message(&message.event_id, &wrapper_id, &ctx.account)?;
            return Err(err);
        }
        Ok(message)
    }

    pub async fn search_messages(&self, term: &str) -> Result<Vec<Message>> {
        let ctx = self.sessions.require_current().await?;
        self.messages.search(&ctx.account, term)
    }

    // --- key material and relays ---

    pub async fn publish_key_package(&self) -> Result<Receipt> {
        let ctx = self.sessions.require_current().await?;
        self.key_packages.publish(&ctx).await
    }

    pub async fn delete_key_packages(&self) -> Result<Option<PublishReceipt>> {
        let ctx = self.sessions.require_current().await?;
        self.key_packages.delete_key_package_events(&ctx).await
    }

    /// Replace the account's relay set and announce the three relay lists.
    pub async fn publish_relay_list(&self, relays: Vec<Relay>) -> Result<Vec<PublishReceipt>> {
        let ctx = self.sessions.require_current().await?;
        self.store.replace_account_relays(&ctx.account, &relays)?;

        let urls: Vec<String> = relays.iter().map(|r| r.url.clone()).collect();
        let relay_tags: Vec<Vec<String>> = urls
            .iter()
            .map(|url| vec!["relay".into(), url.clone()])
            .collect();
        let mut receipts = Vec::with_capacity(3);
        for list_kind in [kind::RELAY_LIST, kind::INBOX_RELAYS, kind::KEY_PACKAGE_RELAYS] {
            let event = ctx.keys.sign_event(
                Timestamp::now(),
                list_kind,
                relay_tags.clone(),
                String::new(),
            );
            receipts.push(self.gateway.publish(&urls, event).await?);
        }
        Ok(receipts)
    }

    /// Export the raw exporter secret for a group, hex encoded.
    pub async fn export_group_secret(&self, group_id: &GroupId) -> Result<String> {
        let ctx = self.sessions.require_current().await?;
        Ok(hex::encode(ctx.engine.export_secret(group_id)?))
    }

    // --- contacts ---

    /// Profile plus capability flags for one pubkey, fetched live.
    pub async fn query_contact(&self, pubkey: &PublicKey) -> Result<EnrichedContact> {
        let ctx = self.sessions.require_current().await?;
        let relays: Vec<String> = self
            .store
            .account_relays(&ctx.account)?
            .into_iter()
            .map(|r| r.url)
            .collect();
        if relays.is_empty() {
            return Err(crate::gateway::GatewayError::NoRelays("account").into());
        }

        let profiles = self
            .gateway
            .fetch(
                &relays,
                EventFilter::kinds(&[kind::METADATA]).author(pubkey.clone()),
            )
            .await?;
        let metadata = profiles
            .into_iter()
            .max_by_key(|e| e.created_at)
            .and_then(|e| serde_json::from_str::<AccountMetadata>(&e.content).ok());

        let has_key_package = self
            .key_packages
            .has_valid_key_package(&ctx, pubkey)
            .await?;
        let inbox = self
            .gateway
            .fetch(
                &relays,
                EventFilter::kinds(&[kind::INBOX_RELAYS]).author(pubkey.clone()),
            )
            .await?;

        Ok(EnrichedContact {
            pubkey: pubkey.clone(),
            metadata,
            has_key_package,
            has_inbox_relays: !inbox.is_empty(),
        })
    }

    /// Refresh the active account's own profile from the relays.
    pub async fn refresh_account_metadata(&self) -> Result<Option<AccountMetadata>> {
        let ctx = self.sessions.require_current().await?;
        let contact = self.query_contact(&ctx.account).await?;
        if let Some(metadata) = &contact.metadata {
            self.store.update_account_metadata(&ctx.account, metadata)?;
        }
        Ok(contact.metadata)
    }

    // --- teardown ---

    /// Wipe everything: engine state, worker, database. Leaves the process
    /// with no accounts and no active session.
    pub async fn delete_all_data(&self) -> Result<()> {
        self.stop_worker().await;
        self.sessions.clear().await?;
        self.store.wipe()?;
        info!("all local data deleted");
        Ok(())
    }
}
