//! Inbound event dispatch.
//!
//! One worker per active session drains the gateway subscription and routes
//! events by kind. Each event is fully processed before the next receive,
//! so invite and message handling for one account never race on a group's
//! epoch; backpressure falls onto the channel. An account switch stops the
//! worker and waits for it before touching the session, so an in-flight
//! event never runs against a replaced engine.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::invites::InviteProcessor;
use crate::messages::MessageProcessor;
use crate::session::SessionContext;
use crate::types::{kind, RelayEvent};

pub struct Dispatcher {
    invites: Arc<InviteProcessor>,
    messages: Arc<MessageProcessor>,
}

impl Dispatcher {
    pub fn new(invites: Arc<InviteProcessor>, messages: Arc<MessageProcessor>) -> Self {
        Self { invites, messages }
    }

    /// Drain `inbox` for the given session until its sender side closes.
    pub fn spawn(
        self: Arc<Self>,
        ctx: Arc<SessionContext>,
        mut inbox: mpsc::Receiver<RelayEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = inbox.recv().await {
                self.dispatch(&ctx, &event).await;
            }
            debug!(account = %ctx.account, "dispatch worker stopped");
        })
    }

    /// Route one event. Failures are recorded by the processors themselves;
    /// here they are only logged so the worker keeps draining.
    pub async fn dispatch(&self, ctx: &SessionContext, event: &RelayEvent) {
        match event.kind {
            kind::GIFT_WRAP => {
                if let Err(err) = self.invites.process_welcome(ctx, event).await {
                    error!(wrapper = %event.id, error = %err, "invite intake failed");
                }
            }
            kind::GROUP_MESSAGE => {
                if let Err(err) = self.messages.process_event(ctx, event).await {
                    error!(wrapper = %event.id, error = %err, "message intake failed");
                }
            }
            other => {
                debug!(kind = other, event = %event.id, "ignoring event kind");
            }
        }
    }
}
