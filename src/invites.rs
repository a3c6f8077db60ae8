//! Invite pipeline: gift-wrapped welcome intake, accept, and decline.
//!
//! Intake is idempotent by wrapping event id; a replayed gift wrap returns
//! the prior outcome without touching the crypto engine. Accepting is the
//! only path that creates a Group row, and it must succeed at the crypto
//! layer first.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::events::{LifecycleEvent, Notifier};
use crate::session::SessionContext;
use crate::store::models::{
    FailureRecord, Group, Invite, InviteState, NewInvite, ProcessedState, Relay,
};
use crate::store::Store;
use crate::types::{kind, EventId, GroupState, PublicKey, RelayEvent, RelayPurpose, Rumor};
use crate::wire;

/// What intake did with a gift-wrapped welcome.
#[derive(Clone, Debug)]
pub enum InviteOutcome {
    /// The wrapping event id was already in the ledger; prior outcome stands.
    AlreadyProcessed,
    /// A pending invite was recorded.
    Recorded(Invite),
    /// The account is already an active member of the target group; the
    /// invite was recorded pre-declined.
    AutoDeclined(Invite),
}

pub struct InviteProcessor {
    store: Arc<Store>,
    notifier: Notifier,
}

impl InviteProcessor {
    pub fn new(store: Arc<Store>, notifier: Notifier) -> Self {
        Self { store, notifier }
    }

    /// Intake one kind-1059 event assumed to wrap a welcome.
    pub async fn process_welcome(
        &self,
        ctx: &SessionContext,
        event: &RelayEvent,
    ) -> Result<InviteOutcome> {
        let account = &ctx.account;

        if let Some(prior) = self.store.processed_invite(&event.id, account)? {
            debug!(wrapper = %event.id, state = prior.state.as_str(), "welcome replayed");
            return Ok(InviteOutcome::AlreadyProcessed);
        }

        let rumor = match self.unwrap_welcome(ctx, event) {
            Ok(rumor) => rumor,
            Err(err) => {
                warn!(wrapper = %event.id, error = %err, "welcome unwrap failed");
                self.store.record_invite_failure(&FailureRecord::new(
                    event,
                    account,
                    err.to_string(),
                ))?;
                return Err(err);
            }
        };

        let invite = match self.build_invite(ctx, event, &rumor) {
            Ok(invite) => invite,
            Err(err) => {
                warn!(wrapper = %event.id, error = %err, "welcome rejected");
                self.store.record_invite_failure(&FailureRecord::new(
                    event,
                    account,
                    err.to_string(),
                ))?;
                return Err(err);
            }
        };

        // Stale invite for a group we are already in: record it declined so
        // the ledger still covers the wrapper, but never surface it.
        let already_member = self
            .store
            .get_group(&invite.mls_group_id, account)?
            .map(|g| g.state == GroupState::Active)
            .unwrap_or(false);

        if already_member {
            let mut declined = invite;
            declined.state = InviteState::Declined;
            self.store.record_invite(&NewInvite {
                invite: declined.clone(),
                wrapper_id: event.id.clone(),
            })?;
            info!(group = %declined.mls_group_id, "invite auto-declined: already a member");
            return Ok(InviteOutcome::AutoDeclined(declined));
        }

        self.store.record_invite(&NewInvite {
            invite: invite.clone(),
            wrapper_id: event.id.clone(),
        })?;
        info!(invite = %invite.event_id, group = %invite.mls_group_id, "invite recorded");
        self.notifier.emit(LifecycleEvent::InviteReceived {
            invite: invite.clone(),
        });
        Ok(InviteOutcome::Recorded(invite))
    }

    fn unwrap_welcome(&self, ctx: &SessionContext, event: &RelayEvent) -> Result<Rumor> {
        let rumor = wire::unseal_gift(event, &ctx.keys)?;
        if rumor.kind != kind::WELCOME {
            return Err(CoreError::invalid_input(format!(
                "gift wrap carries kind {}, expected {}",
                rumor.kind,
                kind::WELCOME
            )));
        }
        Ok(rumor)
    }

    /// Validate the welcome through the crypto engine and assemble the
    /// invite row from the authenticated group metadata. The inviter is
    /// whoever authored the inner rumor, not the throwaway wrap signer.
    fn build_invite(
        &self,
        ctx: &SessionContext,
        event: &RelayEvent,
        rumor: &Rumor,
    ) -> Result<Invite> {
        let welcome_bytes = BASE64
            .decode(&rumor.content)
            .map_err(|_| CoreError::invalid_input("welcome content is not valid base64"))?;
        let preview = ctx.engine.preview_welcome(&welcome_bytes)?;

        let member_count = rumor
            .tag_value("members")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0);

        Ok(Invite {
            event_id: rumor.id.clone(),
            account_pubkey: ctx.account.clone(),
            event: serde_json::to_value(rumor).map_err(crate::store::StoreError::from)?,
            mls_group_id: preview.group_id,
            nostr_group_id: preview.descriptor.transport_group_id.clone(),
            group_name: preview.descriptor.name.clone(),
            group_description: preview.descriptor.description.clone(),
            group_admin_pubkeys: preview.descriptor.admins.clone(),
            group_relays: preview.descriptor.relays.clone(),
            inviter: rumor.pubkey.clone(),
            member_count,
            state: InviteState::Pending,
            outer_event_id: Some(event.id.clone()),
        })
    }

    /// Accept a pending invite: join at the crypto layer, then materialize
    /// the Group row and its relays. On a crypto failure the invite stays
    /// pending and the caller may retry with `JoinFailed`.
    pub async fn accept(&self, ctx: &SessionContext, invite_id: &EventId) -> Result<Group> {
        let account = &ctx.account;
        let invite = self
            .store
            .get_invite(invite_id, account)?
            .ok_or_else(|| CoreError::not_found(format!("invite {invite_id}")))?;
        if invite.state != InviteState::Pending {
            return Err(CoreError::InviteAlreadyResolved(
                invite.state.as_str().to_owned(),
            ));
        }

        let rumor = invite.welcome_rumor()?;
        let welcome_bytes = BASE64
            .decode(&rumor.content)
            .map_err(|_| CoreError::invalid_input("welcome content is not valid base64"))?;

        let joined = ctx
            .engine
            .join_from_welcome(&welcome_bytes)
            .map_err(|e| CoreError::JoinFailed(e.to_string()))?;

        let group = Group {
            mls_group_id: joined.group_id.clone(),
            account_pubkey: account.clone(),
            nostr_group_id: joined.descriptor.transport_group_id.clone(),
            name: joined.descriptor.name.clone(),
            description: joined.descriptor.description.clone(),
            admin_pubkeys: joined.descriptor.admins.clone(),
            epoch: joined.epoch,
            state: GroupState::Active,
            last_message_id: None,
            last_message_at: None,
            group_type: joined.descriptor.group_type,
        };
        self.store.upsert_group(&group)?;

        let relays: Vec<Relay> = invite
            .group_relays
            .iter()
            .map(|url| Relay {
                url: url.clone(),
                purpose: RelayPurpose::ReadWrite,
            })
            .collect();
        self.store
            .replace_group_relays(&group.mls_group_id, account, &relays)?;

        self.store
            .resolve_invite(invite_id, account, InviteState::Accepted)?;
        info!(group = %group.mls_group_id, epoch = group.epoch, "invite accepted");

        self.notifier.emit(LifecycleEvent::InviteAccepted {
            invite_id: invite_id.clone(),
            group: group.clone(),
        });
        self.notifier.emit(LifecycleEvent::GroupJoined {
            group: group.clone(),
        });
        Ok(group)
    }

    /// Decline a pending invite. No crypto engine involvement.
    pub async fn decline(&self, ctx: &SessionContext, invite_id: &EventId) -> Result<Invite> {
        let account = &ctx.account;
        let invite = self
            .store
            .get_invite(invite_id, account)?
            .ok_or_else(|| CoreError::not_found(format!("invite {invite_id}")))?;
        if invite.state != InviteState::Pending {
            return Err(CoreError::InviteAlreadyResolved(
                invite.state.as_str().to_owned(),
            ));
        }

        self.store
            .resolve_invite(invite_id, account, InviteState::Declined)?;
        info!(invite = %invite_id, "invite declined");
        self.store
            .get_invite(invite_id, account)?
            .ok_or_else(|| CoreError::not_found(format!("invite {invite_id}")))
    }

    pub fn list(
        &self,
        account: &PublicKey,
        state: Option<InviteState>,
    ) -> Result<Vec<Invite>> {
        Ok(self.store.list_invites(account, state)?)
    }

    pub fn get(&self, account: &PublicKey, invite_id: &EventId) -> Result<Option<Invite>> {
        Ok(self.store.get_invite(invite_id, account)?)
    }

    /// Prior ledger outcome for a wrapping event id, if any.
    pub fn prior_outcome(
        &self,
        account: &PublicKey,
        wrapper_id: &EventId,
    ) -> Result<Option<ProcessedState>> {
        Ok(self
            .store
            .processed_invite(wrapper_id, account)?
            .map(|p| p.state))
    }
}
