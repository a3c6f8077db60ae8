//! Durable MLS group sessions over relay-based transports.
//!
//! This crate is the engine below a messaging UI: it keeps group and
//! session state in SQLite, admits members through gift-wrapped welcome
//! handshakes, ingests relayed MLS ciphertext with dual-layer dedup
//! (wrapping event id in an append-only ledger, inner rumor id in the
//! transcript), and keeps key packages published so the account stays
//! invitable. The transport itself and the UI both live outside, behind
//! [`gateway::RelayGateway`] and [`events::LifecycleEvent`].
//!
//! The ordinary entry point is [`Covey`]:
//!
//! ```no_run
//! # async fn run(gateway: std::sync::Arc<dyn covey::gateway::RelayGateway>) -> covey::Result<()> {
//! let client = covey::Covey::open(std::path::Path::new("./data"), gateway)?;
//! let account = client.create_account().await?;
//! client.publish_key_package().await?;
//! # let _ = account; Ok(())
//! # }
//! ```

pub mod client;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod gateway;
pub mod invites;
pub mod key_packages;
pub mod messages;
pub mod mls;
pub mod session;
pub mod store;
pub mod types;
pub mod wire;

pub use client::{Covey, EnrichedContact};
pub use error::{CoreError, Result};
pub use events::{LifecycleEvent, Notifier};
pub use invites::InviteOutcome;
pub use messages::MessageOutcome;
pub use session::{SessionContext, SessionManager};
pub use store::Store;
pub use types::{EventId, GroupId, PublicKey, RelayEvent, Rumor, Timestamp};
