//! Message pipeline: kind-445 intake, decryption, dedup, and send.
//!
//! Intake runs the dual-layer dedup: the processed-messages ledger keyed by
//! the wrapping event id stops repeat work, and the message row keyed by
//! the inner rumor id stops duplicate transcript entries when the same
//! rumor arrives under a different wrapper. Decryption failures are
//! recorded, never retried; only an epoch-advancing commit can change the
//! result.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::events::{LifecycleEvent, Notifier};
use crate::mls::EngineOutput;
use crate::session::SessionContext;
use crate::store::models::{FailureRecord, Group, Message, NewMessage};
use crate::store::Store;
use crate::types::{kind, EventId, GroupId, GroupState, PublicKey, RelayEvent, Rumor, Timestamp};
use crate::wire::AccountKeys;

const UNKNOWN_GROUP: &str = "unknown-or-inactive-group";

/// What intake did with a kind-445 event.
#[derive(Clone, Debug)]
pub enum MessageOutcome {
    /// Wrapper already in the ledger; nothing done.
    AlreadyProcessed,
    /// An application message was decrypted and persisted.
    Processed(Message),
    /// A membership commit was applied; the stored epoch advanced.
    CommitApplied { new_epoch: u64 },
    /// A commit removed this account; the group is now inactive.
    Removed { new_epoch: u64 },
    /// Proposal stored or message not addressed to us.
    Ignored,
}

pub struct MessageProcessor {
    store: Arc<Store>,
    notifier: Notifier,
}

impl MessageProcessor {
    pub fn new(store: Arc<Store>, notifier: Notifier) -> Self {
        Self { store, notifier }
    }

    /// Intake one kind-445 event.
    pub async fn process_event(
        &self,
        ctx: &SessionContext,
        event: &RelayEvent,
    ) -> Result<MessageOutcome> {
        let account = &ctx.account;

        if let Some(prior) = self.store.processed_message(&event.id, account)? {
            debug!(wrapper = %event.id, state = prior.state.as_str(), "message replayed");
            return Ok(MessageOutcome::AlreadyProcessed);
        }

        let group = match self.resolve_group(account, event)? {
            Some(group) => group,
            None => {
                self.store.record_message_failure(&FailureRecord::new(
                    event,
                    account,
                    UNKNOWN_GROUP,
                ))?;
                return Err(CoreError::not_found(UNKNOWN_GROUP));
            }
        };

        self.notifier.emit(LifecycleEvent::MessageReceived {
            group_id: group.mls_group_id.clone(),
            wrapper_id: event.id.clone(),
        });

        let wire_bytes = match BASE64.decode(&event.content) {
            Ok(bytes) => bytes,
            Err(_) => {
                let reason = "content is not valid base64";
                self.store
                    .record_message_failure(&FailureRecord::new(event, account, reason))?;
                return Err(CoreError::invalid_input(reason));
            }
        };

        let output = match ctx
            .engine
            .process_wire_message(&group.mls_group_id, &wire_bytes)
        {
            Ok(output) => output,
            Err(err) => {
                warn!(wrapper = %event.id, group = %group.mls_group_id, error = %err,
                      "message processing failed");
                self.store.record_message_failure(&FailureRecord::new(
                    event,
                    account,
                    err.ledger_reason(),
                ))?;
                return Err(err.into());
            }
        };

        match output {
            EngineOutput::ApplicationMessage(plaintext) => {
                self.apply_application_message(ctx, event, &group, &plaintext)
            }
            EngineOutput::CommitApplied { new_epoch } => {
                self.store
                    .advance_group_epoch(&group.mls_group_id, account, new_epoch)?;
                self.store.record_message_commit(&event.id, account)?;
                info!(group = %group.mls_group_id, new_epoch, "commit applied");
                Ok(MessageOutcome::CommitApplied { new_epoch })
            }
            EngineOutput::Removed { new_epoch } => {
                self.store
                    .advance_group_epoch(&group.mls_group_id, account, new_epoch)?;
                self.store.set_group_state(
                    &group.mls_group_id,
                    account,
                    GroupState::Inactive,
                )?;
                self.store.record_message_commit(&event.id, account)?;
                info!(group = %group.mls_group_id, "removed from group");
                Ok(MessageOutcome::Removed { new_epoch })
            }
            EngineOutput::ProposalStored | EngineOutput::Ignored => {
                self.store.record_message_commit(&event.id, account)?;
                Ok(MessageOutcome::Ignored)
            }
        }
    }

    fn resolve_group(&self, account: &PublicKey, event: &RelayEvent) -> Result<Option<Group>> {
        let transport_id = match event.transport_group_id() {
            Some(id) => id,
            None => return Ok(None),
        };
        let group = self.store.find_group_by_transport_id(transport_id, account)?;
        Ok(group.filter(|g| g.state == GroupState::Active))
    }

    fn apply_application_message(
        &self,
        ctx: &SessionContext,
        event: &RelayEvent,
        group: &Group,
        plaintext: &[u8],
    ) -> Result<MessageOutcome> {
        let account = &ctx.account;
        let rumor: Rumor = match serde_json::from_slice(plaintext) {
            Ok(rumor) => rumor,
            Err(_) => {
                let reason = "plaintext is not a valid rumor";
                self.store
                    .record_message_failure(&FailureRecord::new(event, account, reason))?;
                return Err(CoreError::invalid_input(reason));
            }
        };
        if !rumor.verify_id() {
            let reason = "rumor id mismatch";
            self.store
                .record_message_failure(&FailureRecord::new(event, account, reason))?;
            return Err(CoreError::invalid_input(reason));
        }

        let message = Message {
            event_id: rumor.id.clone(),
            account_pubkey: account.clone(),
            mls_group_id: group.mls_group_id.clone(),
            author_pubkey: rumor.pubkey.clone(),
            created_at: rumor.created_at,
            content: rumor.content.clone(),
            tags: rumor.tags.clone(),
            event: serde_json::to_value(&rumor).map_err(crate::store::StoreError::from)?,
            outer_event_id: Some(event.id.clone()),
        };
        self.store.record_message(&NewMessage {
            message: message.clone(),
            wrapper_id: event.id.clone(),
        })?;

        let updated = self
            .store
            .get_group(&group.mls_group_id, account)?
            .unwrap_or_else(|| group.clone());
        info!(group = %group.mls_group_id, message = %message.event_id, "message stored");
        self.notifier.emit(LifecycleEvent::MessageProcessed {
            group: updated,
            message: message.clone(),
        });
        Ok(MessageOutcome::Processed(message))
    }

    /// Encrypt and persist an outbound message, returning the signed
    /// kind-445 event ready for publishing. The wrapper is signed with a
    /// throwaway key so the relay learns nothing about the author; our own
    /// row and ledger entry are written immediately so the echoed event is
    /// deduplicated on arrival.
    pub async fn prepare_send(
        &self,
        ctx: &SessionContext,
        group_id: &GroupId,
        content: String,
        tags: Vec<Vec<String>>,
    ) -> Result<(RelayEvent, Message)> {
        let account = &ctx.account;
        let group = self
            .store
            .get_group(group_id, account)?
            .ok_or_else(|| CoreError::not_found(format!("group {group_id}")))?;
        if group.state != GroupState::Active {
            return Err(CoreError::invalid_input("group is inactive"));
        }

        let rumor = Rumor::new(
            account.clone(),
            Timestamp::now(),
            kind::CHAT,
            tags,
            content,
        );
        let rumor_bytes = serde_json::to_vec(&rumor).map_err(crate::store::StoreError::from)?;
        let wire_bytes = ctx.engine.encrypt_message(group_id, &rumor_bytes)?;

        let wrapper = AccountKeys::generate().sign_event(
            Timestamp::now(),
            kind::GROUP_MESSAGE,
            vec![vec!["h".into(), group.nostr_group_id.clone()]],
            BASE64.encode(wire_bytes),
        );

        let message = Message {
            event_id: rumor.id.clone(),
            account_pubkey: account.clone(),
            mls_group_id: group_id.clone(),
            author_pubkey: account.clone(),
            created_at: rumor.created_at,
            content: rumor.content.clone(),
            tags: rumor.tags.clone(),
            event: serde_json::to_value(&rumor).map_err(crate::store::StoreError::from)?,
            outer_event_id: Some(wrapper.id.clone()),
        };
        self.store.record_message(&NewMessage {
            message: message.clone(),
            wrapper_id: wrapper.id.clone(),
        })?;

        Ok((wrapper, message))
    }

    /// Transcript for one group, creation-time ordered.
    pub fn list(&self, account: &PublicKey, group_id: &GroupId) -> Result<Vec<Message>> {
        Ok(self.store.list_messages(group_id, account)?)
    }

    pub fn get(&self, account: &PublicKey, event_id: &EventId) -> Result<Option<Message>> {
        Ok(self.store.get_message(event_id, account)?)
    }

    /// Full-text search across the account's transcripts.
    pub fn search(&self, account: &PublicKey, term: &str) -> Result<Vec<Message>> {
        Ok(self.store.search_messages(account, term)?)
    }
}
