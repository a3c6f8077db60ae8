//! Integration tests for the invite and message pipelines, driven through
//! the processors with a scripted crypto engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use async_trait::async_trait;

use covey::events::Notifier;
use covey::gateway::{EventFilter, GatewayError, PublishReceipt, RelayGateway};
use covey::invites::{InviteOutcome, InviteProcessor};
use covey::messages::{MessageOutcome, MessageProcessor};
use covey::mls::{
    CreatedGroup, EngineCommit, EngineOutput, GroupCryptoEngine, GroupDescriptor, JoinedGroup,
    KeyPackageMaterial, MlsEngineError, WelcomePreview,
};
use covey::session::SessionContext;
use covey::store::models::{Group, InviteState, ProcessedState};
use covey::store::Store;
use covey::types::{kind, GroupId, GroupState, GroupType, PublicKey, Rumor, Timestamp};
use covey::wire::{self, AccountKeys};
use covey::CoreError;

// ─────────────────────────── Mock Engine ───────────────────────────

/// Scripted engine: one fixed group, plaintext-passthrough "decryption",
/// and control prefixes in the wire bytes to trigger commit outcomes.
struct MockEngine {
    group_id: GroupId,
    descriptor: GroupDescriptor,
    epoch: Mutex<HashMap<GroupId, u64>>,
    fail_join: AtomicBool,
    next_error: Mutex<Option<MlsEngineError>>,
}

impl MockEngine {
    fn new(account: &PublicKey) -> Self {
        let group_id = GroupId::from_slice(&[7u8; 32]);
        Self {
            group_id: group_id.clone(),
            descriptor: GroupDescriptor {
                name: "rustaceans".into(),
                description: "a test group".into(),
                admins: vec![account.clone()],
                relays: vec!["wss://relay.example".into()],
                transport_group_id: "beef".into(),
                group_type: GroupType::Group,
            },
            epoch: Mutex::new(HashMap::new()),
            fail_join: AtomicBool::new(false),
            next_error: Mutex::new(None),
        }
    }

    fn set_fail_join(&self, fail: bool) {
        self.fail_join.store(fail, Ordering::SeqCst);
    }

    fn fail_next_with(&self, err: MlsEngineError) {
        *self.next_error.lock().unwrap() = Some(err);
    }
}

impl GroupCryptoEngine for MockEngine {
    fn create_group(
        &self,
        _descriptor: &GroupDescriptor,
        _member_key_packages: &[Vec<u8>],
    ) -> Result<CreatedGroup, MlsEngineError> {
        self.epoch.lock().unwrap().insert(self.group_id.clone(), 0);
        Ok(CreatedGroup {
            group_id: self.group_id.clone(),
            epoch: 0,
            welcome: Some(b"welcome".to_vec()),
        })
    }

    fn preview_welcome(&self, _welcome: &[u8]) -> Result<WelcomePreview, MlsEngineError> {
        Ok(WelcomePreview {
            group_id: self.group_id.clone(),
            descriptor: self.descriptor.clone(),
            epoch: 1,
        })
    }

    fn join_from_welcome(&self, _welcome: &[u8]) -> Result<JoinedGroup, MlsEngineError> {
        if self.fail_join.load(Ordering::SeqCst) {
            return Err(MlsEngineError::WelcomeNotForUs);
        }
        self.epoch.lock().unwrap().insert(self.group_id.clone(), 1);
        Ok(JoinedGroup {
            group_id: self.group_id.clone(),
            descriptor: self.descriptor.clone(),
            epoch: 1,
            members: self.descriptor.admins.clone(),
        })
    }

    fn add_members(
        &self,
        group_id: &GroupId,
        _key_packages: &[Vec<u8>],
    ) -> Result<EngineCommit, MlsEngineError> {
        let mut epochs = self.epoch.lock().unwrap();
        let epoch = epochs.entry(group_id.clone()).or_insert(0);
        *epoch += 1;
        Ok(EngineCommit {
            commit_wire: b"commit".to_vec(),
            welcome: Some(b"welcome".to_vec()),
            new_epoch: *epoch,
        })
    }

    fn remove_members(
        &self,
        group_id: &GroupId,
        _members: &[PublicKey],
    ) -> Result<EngineCommit, MlsEngineError> {
        self.add_members(group_id, &[])
    }

    fn encrypt_message(
        &self,
        _group_id: &GroupId,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, MlsEngineError> {
        Ok(plaintext.to_vec())
    }

    fn process_wire_message(
        &self,
        group_id: &GroupId,
        wire: &[u8],
    ) -> Result<EngineOutput, MlsEngineError> {
        if let Some(err) = self.next_error.lock().unwrap().take() {
            return Err(err);
        }
        if let Some(rest) = wire.strip_prefix(b"COMMIT:".as_slice()) {
            let new_epoch: u64 = std::str::from_utf8(rest).unwrap().parse().unwrap();
            self.epoch
                .lock()
                .unwrap()
                .insert(group_id.clone(), new_epoch);
            return Ok(EngineOutput::CommitApplied { new_epoch });
        }
        if let Some(rest) = wire.strip_prefix(b"REMOVE:".as_slice()) {
            let new_epoch: u64 = std::str::from_utf8(rest).unwrap().parse().unwrap();
            return Ok(EngineOutput::Removed { new_epoch });
        }
        Ok(EngineOutput::ApplicationMessage(wire.to_vec()))
    }

    fn generate_key_package(&self) -> Result<KeyPackageMaterial, MlsEngineError> {
        Ok(KeyPackageMaterial {
            bytes: b"key-package".to_vec(),
            hash_ref: vec![1, 2, 3],
        })
    }

    fn export_secret(&self, _group_id: &GroupId) -> Result<[u8; 32], MlsEngineError> {
        Ok([9u8; 32])
    }

    fn current_epoch(&self, group_id: &GroupId) -> Result<u64, MlsEngineError> {
        Ok(*self.epoch.lock().unwrap().get(group_id).unwrap_or(&0))
    }

    fn members(&self, _group_id: &GroupId) -> Result<Vec<PublicKey>, MlsEngineError> {
        Ok(self.descriptor.admins.clone())
    }

    fn descriptor(&self, _group_id: &GroupId) -> Result<GroupDescriptor, MlsEngineError> {
        Ok(self.descriptor.clone())
    }

    fn wipe(&self) {
        self.epoch.lock().unwrap().clear();
    }
}

// ─────────────────────────── Fixtures ───────────────────────────

struct Fixture {
    store: Arc<Store>,
    ctx: SessionContext,
    engine: Arc<MockEngine>,
    invites: InviteProcessor,
    messages: MessageProcessor,
}

fn fixture() -> Fixture {
    let keys = AccountKeys::generate();
    let account = keys.public_key().clone();
    let store = Arc::new(Store::open_in_memory().unwrap());
    store.insert_account(&account).unwrap();
    store.set_active_account(&account).unwrap();

    let engine = Arc::new(MockEngine::new(&account));
    let notifier = Notifier::new();
    let ctx = SessionContext {
        account,
        keys,
        engine: engine.clone(),
    };
    Fixture {
        invites: InviteProcessor::new(store.clone(), notifier.clone()),
        messages: MessageProcessor::new(store.clone(), notifier),
        store,
        ctx,
        engine,
    }
}

fn inviter_keys() -> AccountKeys {
    AccountKeys::generate()
}

/// A gift-wrapped welcome addressed to the fixture account.
fn welcome_wrap(f: &Fixture, inviter: &AccountKeys) -> covey::RelayEvent {
    let rumor = Rumor::new(
        inviter.public_key().clone(),
        Timestamp::now(),
        kind::WELCOME,
        vec![vec!["members".into(), "3".into()]],
        BASE64.encode(b"welcome"),
    );
    wire::seal_gift(&rumor, &f.ctx.account).unwrap()
}

/// A kind-445 event for the mock group carrying raw wire bytes.
fn group_message_event(wire_bytes: &[u8], created_at: i64) -> covey::RelayEvent {
    AccountKeys::generate().sign_event(
        Timestamp(created_at),
        kind::GROUP_MESSAGE,
        vec![vec!["h".into(), "beef".into()]],
        BASE64.encode(wire_bytes),
    )
}

fn chat_rumor(author: &AccountKeys, content: &str, at: i64) -> Vec<u8> {
    let rumor = Rumor::new(
        author.public_key().clone(),
        Timestamp(at),
        kind::CHAT,
        vec![],
        content.into(),
    );
    serde_json::to_vec(&rumor).unwrap()
}

fn joined_group(f: &Fixture) -> Group {
    f.store
        .get_group(&f.engine.group_id, &f.ctx.account)
        .unwrap()
        .unwrap()
}

async fn join_via_invite(f: &Fixture) -> Group {
    let wrap = welcome_wrap(f, &inviter_keys());
    let outcome = f.invites.process_welcome(&f.ctx, &wrap).await.unwrap();
    let invite = match outcome {
        InviteOutcome::Recorded(invite) => invite,
        other => panic!("expected recorded invite, got {other:?}"),
    };
    f.invites.accept(&f.ctx, &invite.event_id).await.unwrap()
}

// ─────────────────────────── Invite flow ───────────────────────────

#[tokio::test]
async fn invite_accept_creates_group_and_relays() {
    let f = fixture();
    let group = join_via_invite(&f).await;

    assert_eq!(group.mls_group_id, f.engine.group_id);
    assert_eq!(group.nostr_group_id, "beef");
    assert_eq!(group.epoch, 1);
    assert_eq!(group.state, GroupState::Active);

    let relays = f
        .store
        .group_relays(&group.mls_group_id, &f.ctx.account)
        .unwrap();
    assert_eq!(relays.len(), 1);
    assert_eq!(relays[0].url, "wss://relay.example");
}

#[tokio::test]
async fn invite_replay_returns_prior_outcome() {
    let f = fixture();
    let wrap = welcome_wrap(&f, &inviter_keys());

    let first = f.invites.process_welcome(&f.ctx, &wrap).await.unwrap();
    assert!(matches!(first, InviteOutcome::Recorded(_)));

    let replay = f.invites.process_welcome(&f.ctx, &wrap).await.unwrap();
    assert!(matches!(replay, InviteOutcome::AlreadyProcessed));
    assert_eq!(
        f.invites.list(&f.ctx.account, None).unwrap().len(),
        1,
        "replay must not create a second invite row"
    );
}

#[tokio::test]
async fn invite_transitions_are_one_shot() {
    let f = fixture();
    let group = join_via_invite(&f).await;
    let invites = f.invites.list(&f.ctx.account, None).unwrap();
    let invite = &invites[0];
    assert_eq!(invite.state, InviteState::Accepted);

    let again = f.invites.accept(&f.ctx, &invite.event_id).await;
    assert!(matches!(again, Err(CoreError::InviteAlreadyResolved(_))));
    let decline = f.invites.decline(&f.ctx, &invite.event_id).await;
    assert!(matches!(decline, Err(CoreError::InviteAlreadyResolved(_))));

    // the group row created by the first accept is untouched
    assert_eq!(joined_group(&f).epoch, group.epoch);
}

#[tokio::test]
async fn join_failure_leaves_invite_pending_and_retryable() {
    let f = fixture();
    let wrap = welcome_wrap(&f, &inviter_keys());
    let invite = match f.invites.process_welcome(&f.ctx, &wrap).await.unwrap() {
        InviteOutcome::Recorded(invite) => invite,
        other => panic!("unexpected outcome {other:?}"),
    };

    f.engine.set_fail_join(true);
    let failed = f.invites.accept(&f.ctx, &invite.event_id).await;
    assert!(matches!(failed, Err(CoreError::JoinFailed(_))));
    assert_eq!(
        f.invites
            .get(&f.ctx.account, &invite.event_id)
            .unwrap()
            .unwrap()
            .state,
        InviteState::Pending
    );
    assert!(f
        .store
        .get_group(&f.engine.group_id, &f.ctx.account)
        .unwrap()
        .is_none());

    // the caller retries after the failure clears
    f.engine.set_fail_join(false);
    let group = f.invites.accept(&f.ctx, &invite.event_id).await.unwrap();
    assert_eq!(group.state, GroupState::Active);
}

#[tokio::test]
async fn invite_for_active_group_is_auto_declined() {
    let f = fixture();
    join_via_invite(&f).await;

    let second = welcome_wrap(&f, &inviter_keys());
    let outcome = f.invites.process_welcome(&f.ctx, &second).await.unwrap();
    let invite = match outcome {
        InviteOutcome::AutoDeclined(invite) => invite,
        other => panic!("expected auto-decline, got {other:?}"),
    };
    assert_eq!(invite.state, InviteState::Declined);

    // ledger still covers the wrapper
    let ledger = f
        .store
        .processed_invite(&second.id, &f.ctx.account)
        .unwrap()
        .unwrap();
    assert_eq!(ledger.state, ProcessedState::Processed);
}

#[tokio::test]
async fn garbled_wrap_is_recorded_as_failure() {
    let f = fixture();
    // a gift wrap addressed to someone else cannot be unsealed
    let other = AccountKeys::generate();
    let rumor = Rumor::new(
        inviter_keys().public_key().clone(),
        Timestamp::now(),
        kind::WELCOME,
        vec![],
        BASE64.encode(b"welcome"),
    );
    let wrap = wire::seal_gift(&rumor, other.public_key()).unwrap();

    assert!(f.invites.process_welcome(&f.ctx, &wrap).await.is_err());
    let ledger = f
        .store
        .processed_invite(&wrap.id, &f.ctx.account)
        .unwrap()
        .unwrap();
    assert_eq!(ledger.state, ProcessedState::Failed);
    assert!(ledger.failure_reason.is_some());

    // replay of the failed wrapper is a no-op, not a retry
    let replay = f.invites.process_welcome(&f.ctx, &wrap).await.unwrap();
    assert!(matches!(replay, InviteOutcome::AlreadyProcessed));
}

// ─────────────────────────── Message flow ───────────────────────────

#[tokio::test]
async fn same_rumor_under_two_wrappers_yields_one_message() {
    let f = fixture();
    join_via_invite(&f).await;

    let author = inviter_keys();
    let rumor_bytes = chat_rumor(&author, "hello from w1/w2", 1000);
    let w1 = group_message_event(&rumor_bytes, 1001);
    let w2 = group_message_event(&rumor_bytes, 1002);
    assert_ne!(w1.id, w2.id);

    let first = f.messages.process_event(&f.ctx, &w1).await.unwrap();
    assert!(matches!(first, MessageOutcome::Processed(_)));
    let second = f.messages.process_event(&f.ctx, &w2).await.unwrap();
    assert!(matches!(second, MessageOutcome::Processed(_)));

    let transcript = f
        .messages
        .list(&f.ctx.account, &f.engine.group_id)
        .unwrap();
    assert_eq!(transcript.len(), 1, "one transcript entry for both wrappers");

    // both wrappers are in the ledger
    assert!(f
        .store
        .processed_message(&w1.id, &f.ctx.account)
        .unwrap()
        .is_some());
    assert!(f
        .store
        .processed_message(&w2.id, &f.ctx.account)
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn wrapper_replay_is_idempotent() {
    let f = fixture();
    join_via_invite(&f).await;

    let event = group_message_event(&chat_rumor(&inviter_keys(), "once", 10), 11);
    f.messages.process_event(&f.ctx, &event).await.unwrap();
    let replay = f.messages.process_event(&f.ctx, &event).await.unwrap();
    assert!(matches!(replay, MessageOutcome::AlreadyProcessed));
    assert_eq!(
        f.messages
            .list(&f.ctx.account, &f.engine.group_id)
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn stale_epoch_failure_is_recorded_not_retried() {
    let f = fixture();
    join_via_invite(&f).await;

    f.engine.fail_next_with(MlsEngineError::EpochMismatch {
        message_epoch: 0,
        group_epoch: 1,
    });
    let event = group_message_event(&chat_rumor(&inviter_keys(), "stale", 10), 11);
    let result = f.messages.process_event(&f.ctx, &event).await;
    assert!(matches!(result, Err(CoreError::Crypto(_))));

    let ledger = f
        .store
        .processed_message(&event.id, &f.ctx.account)
        .unwrap()
        .unwrap();
    assert_eq!(ledger.state, ProcessedState::Failed);

    // the replay hits the ledger without touching the engine again
    let replay = f.messages.process_event(&f.ctx, &event).await.unwrap();
    assert!(matches!(replay, MessageOutcome::AlreadyProcessed));
}

#[tokio::test]
async fn message_for_unknown_group_fails_into_ledger() {
    let f = fixture();
    // no group joined
    let event = group_message_event(&chat_rumor(&inviter_keys(), "lost", 10), 11);
    assert!(f.messages.process_event(&f.ctx, &event).await.is_err());

    let ledger = f
        .store
        .processed_message(&event.id, &f.ctx.account)
        .unwrap()
        .unwrap();
    assert_eq!(
        ledger.failure_reason.as_deref(),
        Some("unknown-or-inactive-group")
    );
}

#[tokio::test]
async fn commit_advances_stored_epoch_monotonically() {
    let f = fixture();
    join_via_invite(&f).await;

    let up = group_message_event(b"COMMIT:5", 20);
    let outcome = f.messages.process_event(&f.ctx, &up).await.unwrap();
    assert!(matches!(outcome, MessageOutcome::CommitApplied { new_epoch: 5 }));
    assert_eq!(joined_group(&f).epoch, 5);

    // a later-arriving commit for an older epoch cannot move it back
    let down = group_message_event(b"COMMIT:3", 21);
    f.messages.process_event(&f.ctx, &down).await.unwrap();
    assert_eq!(joined_group(&f).epoch, 5);
}

#[tokio::test]
async fn removal_deactivates_group_and_blocks_messages() {
    let f = fixture();
    join_via_invite(&f).await;

    let removal = group_message_event(b"REMOVE:4", 30);
    let outcome = f.messages.process_event(&f.ctx, &removal).await.unwrap();
    assert!(matches!(outcome, MessageOutcome::Removed { new_epoch: 4 }));
    assert_eq!(joined_group(&f).state, GroupState::Inactive);

    // messages for the now-inactive group are ledgered as failures
    let event = group_message_event(&chat_rumor(&inviter_keys(), "too late", 40), 41);
    assert!(f.messages.process_event(&f.ctx, &event).await.is_err());
    let ledger = f
        .store
        .processed_message(&event.id, &f.ctx.account)
        .unwrap()
        .unwrap();
    assert_eq!(ledger.state, ProcessedState::Failed);
}

#[tokio::test]
async fn transcript_sorted_by_creation_not_arrival() {
    let f = fixture();
    join_via_invite(&f).await;

    let author = inviter_keys();
    let late = group_message_event(&chat_rumor(&author, "second", 200), 500);
    let early = group_message_event(&chat_rumor(&author, "first", 100), 501);

    // arrival order inverted
    f.messages.process_event(&f.ctx, &late).await.unwrap();
    f.messages.process_event(&f.ctx, &early).await.unwrap();

    let transcript = f
        .messages
        .list(&f.ctx.account, &f.engine.group_id)
        .unwrap();
    assert_eq!(transcript[0].content, "first");
    assert_eq!(transcript[1].content, "second");
}

#[tokio::test]
async fn own_send_is_deduplicated_on_echo() {
    let f = fixture();
    join_via_invite(&f).await;

    let (wrapper, message) = f
        .messages
        .prepare_send(&f.ctx, &f.engine.group_id, "mine".into(), vec![])
        .await
        .unwrap();

    // the relay echoes our own wrapper back
    let replay = f.messages.process_event(&f.ctx, &wrapper).await.unwrap();
    assert!(matches!(replay, MessageOutcome::AlreadyProcessed));

    let transcript = f
        .messages
        .list(&f.ctx.account, &f.engine.group_id)
        .unwrap();
    assert_eq!(transcript.len(), 1);
    assert_eq!(transcript[0].event_id, message.event_id);
}

#[tokio::test]
async fn last_message_denormalization_tracks_newest() {
    let f = fixture();
    join_via_invite(&f).await;

    let author = inviter_keys();
    let newest = group_message_event(&chat_rumor(&author, "newest", 900), 901);
    let older = group_message_event(&chat_rumor(&author, "older", 800), 902);

    f.messages.process_event(&f.ctx, &newest).await.unwrap();
    f.messages.process_event(&f.ctx, &older).await.unwrap();

    let group = joined_group(&f);
    assert_eq!(group.last_message_at, Some(Timestamp(900)));
}

// ─────────────────────────── Account switch ───────────────────────────

/// Gateway that fans pushed events out to every live subscription and
/// accepts every publish.
struct MockGateway {
    senders: Mutex<Vec<tokio::sync::mpsc::Sender<covey::RelayEvent>>>,
}

impl MockGateway {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            senders: Mutex::new(Vec::new()),
        })
    }

    async fn push(&self, event: covey::RelayEvent) {
        let senders = self.senders.lock().unwrap().clone();
        for sender in senders {
            let _ = sender.send(event.clone()).await;
        }
    }
}

#[async_trait]
impl RelayGateway for MockGateway {
    async fn publish(
        &self,
        _relays: &[String],
        event: covey::RelayEvent,
    ) -> Result<PublishReceipt, GatewayError> {
        Ok(PublishReceipt {
            event_id: event.id,
            accepted: vec!["wss://mock.example".into()],
            rejected: vec![],
        })
    }

    async fn fetch(
        &self,
        _relays: &[String],
        _filter: EventFilter,
    ) -> Result<Vec<covey::RelayEvent>, GatewayError> {
        Ok(vec![])
    }

    fn subscribe(&self) -> tokio::sync::mpsc::Receiver<covey::RelayEvent> {
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        self.senders.lock().unwrap().push(tx);
        rx
    }
}

/// Engine whose welcome preview signals entry, then blocks until released.
/// Stands in for any slow cryptographic processing of an inbound event.
struct StallingEngine {
    entered: Mutex<Option<std::sync::mpsc::Sender<()>>>,
    release: Mutex<Option<std::sync::mpsc::Receiver<()>>>,
}

impl GroupCryptoEngine for StallingEngine {
    fn create_group(
        &self,
        _descriptor: &GroupDescriptor,
        _member_key_packages: &[Vec<u8>],
    ) -> Result<CreatedGroup, MlsEngineError> {
        unimplemented!()
    }

    fn preview_welcome(&self, _welcome: &[u8]) -> Result<WelcomePreview, MlsEngineError> {
        if let Some(tx) = self.entered.lock().unwrap().take() {
            let _ = tx.send(());
        }
        if let Some(rx) = self.release.lock().unwrap().take() {
            let _ = rx.recv();
        }
        Err(MlsEngineError::WelcomeNotForUs)
    }

    fn join_from_welcome(&self, _welcome: &[u8]) -> Result<JoinedGroup, MlsEngineError> {
        unimplemented!()
    }

    fn add_members(
        &self,
        _group_id: &GroupId,
        _key_packages: &[Vec<u8>],
    ) -> Result<EngineCommit, MlsEngineError> {
        unimplemented!()
    }

    fn remove_members(
        &self,
        _group_id: &GroupId,
        _members: &[PublicKey],
    ) -> Result<EngineCommit, MlsEngineError> {
        unimplemented!()
    }

    fn encrypt_message(
        &self,
        _group_id: &GroupId,
        _plaintext: &[u8],
    ) -> Result<Vec<u8>, MlsEngineError> {
        unimplemented!()
    }

    fn process_wire_message(
        &self,
        _group_id: &GroupId,
        _wire: &[u8],
    ) -> Result<EngineOutput, MlsEngineError> {
        unimplemented!()
    }

    fn generate_key_package(&self) -> Result<KeyPackageMaterial, MlsEngineError> {
        unimplemented!()
    }

    fn export_secret(&self, _group_id: &GroupId) -> Result<[u8; 32], MlsEngineError> {
        unimplemented!()
    }

    fn current_epoch(&self, _group_id: &GroupId) -> Result<u64, MlsEngineError> {
        Ok(0)
    }

    fn members(&self, _group_id: &GroupId) -> Result<Vec<PublicKey>, MlsEngineError> {
        Ok(vec![])
    }

    fn descriptor(&self, _group_id: &GroupId) -> Result<GroupDescriptor, MlsEngineError> {
        unimplemented!()
    }

    fn wipe(&self) {}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn account_switch_waits_for_inflight_processing() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = MockGateway::new();

    let (entered_tx, entered_rx) = std::sync::mpsc::channel();
    let (release_tx, release_rx) = std::sync::mpsc::channel();
    let engine = Arc::new(StallingEngine {
        entered: Mutex::new(Some(entered_tx)),
        release: Mutex::new(Some(release_rx)),
    });
    let factory: covey::session::EngineFactory =
        Box::new(move |_| Ok(engine.clone() as Arc<dyn GroupCryptoEngine>));

    let client = Arc::new(
        covey::Covey::open_with_engine_factory(dir.path(), gateway.clone(), factory).unwrap(),
    );
    let first = client.create_account().await.unwrap();

    // a gift wrap addressed to the first account reaches its worker and
    // stalls inside the engine
    let rumor = Rumor::new(
        inviter_keys().public_key().clone(),
        Timestamp::now(),
        kind::WELCOME,
        vec![],
        BASE64.encode(b"welcome"),
    );
    let wrap = wire::seal_gift(&rumor, &first.pubkey).unwrap();
    gateway.push(wrap).await;
    entered_rx
        .recv_timeout(std::time::Duration::from_secs(5))
        .unwrap();

    // switching accounts while the event is in flight must block until the
    // event finishes against the session it started with
    let switcher = {
        let client = client.clone();
        tokio::spawn(async move { client.create_account().await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(
        !switcher.is_finished(),
        "switch completed while an event was still being processed"
    );

    release_tx.send(()).unwrap();
    let second = switcher.await.unwrap().unwrap();
    assert_ne!(second.pubkey, first.pubkey);
}
