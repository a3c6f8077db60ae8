//! Relay gateway boundary.
//!
//! The transport client itself (connecting, subscribing, publishing) lives
//! outside this crate; it is reached through [`RelayGateway`]. Implementations
//! deliver inbound events through the channel handed to
//! [`RelayGateway::subscribe`] and are expected to provide at-least-once,
//! possibly out-of-order, possibly duplicated delivery — the processors in
//! this crate are built around exactly that contract.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::types::{EventId, PublicKey, RelayEvent};

/// Errors originating from the relay gateway layer.
///
/// String payloads carry the underlying transport error message. These are
/// human-readable but not structured — callers should treat them as opaque
/// diagnostic text, not match on their content. All gateway failures are
/// retryable from the caller's perspective.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("relay publish error: {0}")]
    Publish(String),
    #[error("relay fetch error: {0}")]
    Fetch(String),
    #[error("no relays configured for {0}")]
    NoRelays(&'static str),
}

/// Subscription filter for fetches. Empty fields match everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub kinds: Vec<u16>,
    pub authors: Vec<PublicKey>,
    /// Match events carrying a `p` tag with this value.
    pub p_tag: Option<PublicKey>,
    /// Match events carrying an `h` tag with this value.
    pub h_tag: Option<String>,
    pub limit: Option<usize>,
}

impl EventFilter {
    pub fn kinds(kinds: &[u16]) -> Self {
        Self {
            kinds: kinds.to_vec(),
            ..Self::default()
        }
    }

    pub fn author(mut self, author: PublicKey) -> Self {
        self.authors.push(author);
        self
    }

    /// Whether `event` matches this filter.
    pub fn matches(&self, event: &RelayEvent) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        if !self.authors.is_empty() && !self.authors.contains(&event.pubkey) {
            return false;
        }
        if let Some(p) = &self.p_tag {
            if event.tag_value("p") != Some(p.as_hex()) {
                return false;
            }
        }
        if let Some(h) = &self.h_tag {
            if event.tag_value("h") != Some(h.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Outcome of publishing one event to a set of relays.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishReceipt {
    pub event_id: EventId,
    /// Relay URLs that accepted the event.
    pub accepted: Vec<String>,
    /// Relay URLs that rejected it, with the relay's reason.
    pub rejected: Vec<(String, String)>,
}

impl PublishReceipt {
    /// Publishing succeeded if at least one relay accepted.
    pub fn is_success(&self) -> bool {
        !self.accepted.is_empty()
    }
}

/// Send/receive boundary to the relay network.
///
/// Each call to [`subscribe`](Self::subscribe) creates a fresh channel;
/// implementations fan inbound events out to every live receiver and prune
/// senders whose receiver was dropped on the next dispatch.
#[async_trait]
pub trait RelayGateway: Send + Sync + 'static {
    /// Publish a signed event to the given relays.
    async fn publish(
        &self,
        relays: &[String],
        event: RelayEvent,
    ) -> Result<PublishReceipt, GatewayError>;

    /// One-shot fetch of stored events matching `filter`.
    async fn fetch(
        &self,
        relays: &[String],
        filter: EventFilter,
    ) -> Result<Vec<RelayEvent>, GatewayError>;

    /// Subscribe to live inbound events.
    fn subscribe(&self) -> mpsc::Receiver<RelayEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{kind, Timestamp};
    use crate::wire::AccountKeys;

    #[test]
    fn filter_matches_kind_and_tags() {
        let keys = AccountKeys::generate();
        let event = keys.sign_event(
            Timestamp::now(),
            kind::GROUP_MESSAGE,
            vec![vec!["h".into(), "feed".into()]],
            String::new(),
        );

        assert!(EventFilter::kinds(&[kind::GROUP_MESSAGE]).matches(&event));
        assert!(!EventFilter::kinds(&[kind::GIFT_WRAP]).matches(&event));

        let mut with_tag = EventFilter::kinds(&[kind::GROUP_MESSAGE]);
        with_tag.h_tag = Some("feed".into());
        assert!(with_tag.matches(&event));
        with_tag.h_tag = Some("other".into());
        assert!(!with_tag.matches(&event));
    }

    #[test]
    fn receipt_success_needs_one_accepting_relay() {
        let receipt = PublishReceipt {
            event_id: EventId::from_bytes([7u8; 32]),
            accepted: vec![],
            rejected: vec![("wss://r".into(), "blocked".into())],
        };
        assert!(!receipt.is_success());
    }
}
