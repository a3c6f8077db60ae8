//! Lifecycle notifications for the presentation layer.
//!
//! Emission never blocks and never fails: with no subscribers the event is
//! dropped. Consumers that fall behind see `Lagged` from the broadcast
//! channel and are expected to re-query the store.

use tokio::sync::broadcast;
use tracing::debug;

use crate::store::models::{Group, Invite, Message};
use crate::types::{EventId, GroupId, PublicKey};

const CHANNEL_CAPACITY: usize = 256;

/// State changes worth surfacing to a UI.
#[derive(Clone, Debug)]
pub enum LifecycleEvent {
    /// A session context finished initializing for this account.
    SessionReady { account: PublicKey },
    /// The active account switched (or was first set).
    AccountChanged { account: PublicKey },
    /// A new pending invite was recorded.
    InviteReceived { invite: Invite },
    /// An invite was accepted and its group row exists.
    InviteAccepted { invite_id: EventId, group: Group },
    /// This account became a member of a group (via create or accept).
    GroupJoined { group: Group },
    /// A raw group-message event arrived, before processing.
    MessageReceived { group_id: GroupId, wrapper_id: EventId },
    /// A message was decrypted and persisted; carries the updated group
    /// snapshot for list refreshes.
    MessageProcessed { group: Group, message: Message },
    /// The active account logged out; no account is active.
    SessionCleared,
}

/// Fan-out point for [`LifecycleEvent`]s.
#[derive(Clone)]
pub struct Notifier {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl Notifier {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: LifecycleEvent) {
        // send only errors when there are no receivers.
        if self.sender.send(event).is_err() {
            debug!("lifecycle event dropped: no subscribers");
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_without_subscribers_does_not_panic() {
        let notifier = Notifier::new();
        notifier.emit(LifecycleEvent::SessionCleared);
    }

    #[tokio::test]
    async fn subscriber_receives_events() {
        let notifier = Notifier::new();
        let mut rx = notifier.subscribe();
        notifier.emit(LifecycleEvent::SessionCleared);
        match rx.recv().await.unwrap() {
            LifecycleEvent::SessionCleared => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
