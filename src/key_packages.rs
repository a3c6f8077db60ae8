//! Key package publication and freshness.
//!
//! Key packages are single-use: once an inviter consumes one in an add
//! commit, a fresh one must be published before this account can be
//! invited again. The publisher generates material through the crypto
//! engine and pushes it, together with the three relay-purpose lists, out
//! through the gateway. Scheduling republication is the caller's job.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::info;

use crate::error::{CoreError, Result};
use crate::gateway::{EventFilter, PublishReceipt, RelayGateway};
use crate::session::SessionContext;
use crate::store::Store;
use crate::types::{kind, EventId, PublicKey, Timestamp};

/// Outcome of a publish run: the key package receipt plus one receipt per
/// relay-list kind.
#[derive(Clone, Debug)]
pub struct Receipt {
    pub key_package: PublishReceipt,
    pub relay_lists: Vec<PublishReceipt>,
}

impl Receipt {
    /// True when the key package landed on at least one relay.
    pub fn is_success(&self) -> bool {
        self.key_package.is_success()
    }
}

pub struct KeyPackagePublisher {
    store: Arc<Store>,
    gateway: Arc<dyn RelayGateway>,
}

impl KeyPackagePublisher {
    pub fn new(store: Arc<Store>, gateway: Arc<dyn RelayGateway>) -> Self {
        Self { store, gateway }
    }

    fn relay_urls(&self, account: &PublicKey) -> Result<Vec<String>> {
        let urls: Vec<String> = self
            .store
            .account_relays(account)?
            .into_iter()
            .map(|r| r.url)
            .collect();
        if urls.is_empty() {
            return Err(crate::gateway::GatewayError::NoRelays("account").into());
        }
        Ok(urls)
    }

    /// Generate fresh key material and publish it along with the general,
    /// inbox, and key-package relay lists.
    pub async fn publish(&self, ctx: &SessionContext) -> Result<Receipt> {
        let account = &ctx.account;
        let relays = self.relay_urls(account)?;

        let material = ctx.engine.generate_key_package()?;
        let mut relays_tag = vec!["relays".to_string()];
        relays_tag.extend(relays.iter().cloned());
        let kp_event = ctx.keys.sign_event(
            Timestamp::now(),
            kind::KEY_PACKAGE,
            vec![
                vec!["mls_protocol_version".into(), "1.0".into()],
                relays_tag,
            ],
            BASE64.encode(&material.bytes),
        );
        let key_package = self.gateway.publish(&relays, kp_event).await?;
        info!(account = %account, event = %key_package.event_id, "key package published");

        let relay_tags: Vec<Vec<String>> = relays
            .iter()
            .map(|url| vec!["relay".into(), url.clone()])
            .collect();
        let mut relay_lists = Vec::with_capacity(3);
        for list_kind in [kind::RELAY_LIST, kind::INBOX_RELAYS, kind::KEY_PACKAGE_RELAYS] {
            let event =
                ctx.keys
                    .sign_event(Timestamp::now(), list_kind, relay_tags.clone(), String::new());
            relay_lists.push(self.gateway.publish(&relays, event).await?);
        }

        Ok(Receipt {
            key_package,
            relay_lists,
        })
    }

    /// Whether `pubkey` currently has a key package published, i.e. can be
    /// invited right now.
    pub async fn has_valid_key_package(
        &self,
        ctx: &SessionContext,
        pubkey: &PublicKey,
    ) -> Result<bool> {
        let relays = self.relay_urls(&ctx.account)?;
        let filter = EventFilter::kinds(&[kind::KEY_PACKAGE]).author(pubkey.clone());
        let events = self.gateway.fetch(&relays, filter).await?;
        Ok(!events.is_empty())
    }

    /// Fetch this account's published key packages usable by an inviter.
    pub async fn fetch_key_package_events(
        &self,
        ctx: &SessionContext,
        pubkey: &PublicKey,
    ) -> Result<Vec<(EventId, Vec<u8>)>> {
        let relays = self.relay_urls(&ctx.account)?;
        let filter = EventFilter::kinds(&[kind::KEY_PACKAGE]).author(pubkey.clone());
        let events = self.gateway.fetch(&relays, filter).await?;
        events
            .into_iter()
            .map(|event| {
                let bytes = BASE64.decode(&event.content).map_err(|_| {
                    CoreError::invalid_input("key package content is not valid base64")
                })?;
                Ok((event.id, bytes))
            })
            .collect()
    }

    /// Request deletion of our published key packages, used before a clean
    /// shutdown republishes fresh material.
    pub async fn delete_key_package_events(&self, ctx: &SessionContext) -> Result<Option<PublishReceipt>> {
        let account = &ctx.account;
        let relays = self.relay_urls(account)?;
        let filter = EventFilter::kinds(&[kind::KEY_PACKAGE]).author(account.clone());
        let published = self.gateway.fetch(&relays, filter).await?;
        if published.is_empty() {
            return Ok(None);
        }

        let tags = published
            .iter()
            .map(|event| vec!["e".into(), event.id.to_string()])
            .collect();
        let deletion = ctx
            .keys
            .sign_event(Timestamp::now(), kind::DELETION, tags, String::new());
        let receipt = self.gateway.publish(&relays, deletion).await?;
        info!(account = %account, count = published.len(), "key package deletion requested");
        Ok(Some(receipt))
    }
}
