//! Relay from the bridge to its companion device.
//!
//! The bridge hands every received PUBLISH payload to a [`RelaySink`].
//! [`PeerRelay`] is the TCP implementation: it delivers immediately while
//! the companion is reachable and otherwise keeps the last value in a
//! [`ContextStore`] so the companion receives it on next contact.
//! [`RelayReceiver`] is the companion side of the link.
//!
//! # Wire format
//!
//! See [`wire`] module for the frame layout.

pub mod error;
pub mod link;
pub mod receiver;
pub mod store;
pub mod wire;

pub use error::RelayError;
pub use link::PeerRelay;
pub use receiver::{RelayReceiver, RelayedMessage};
pub use store::{ContextStore, StoredContext};
pub use wire::{FrameKind, RelayFrame};

use std::time::Duration;

/// Default TCP port of the companion relay receiver.
pub const DEFAULT_RELAY_PORT: u16 = 47_901;

/// Timeout for a single link connection attempt.
pub const LINK_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay between link connection attempts while the companion is unreachable.
pub const LINK_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Destination for payloads received from the broker.
///
/// Delivery is best effort: implementations log failures and never report
/// them back to the caller.
pub trait RelaySink: Send + Sync {
    fn forward(&self, payload: &str);
}
