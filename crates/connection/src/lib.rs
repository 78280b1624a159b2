//! MQTT-over-WebSocket connection engine.
//!
//! A [`Session`] sequences one connection attempt without doing any I/O:
//! transport events go in, actions come out. The [`ConnectionManager`]
//! owns the current session and its WebSocket transport on a single event
//! loop, forwards received payloads to a
//! [`RelaySink`](watchmqtt_relay::RelaySink) and reports progress as
//! [`ConnectionEvent`]s.

pub mod error;
pub mod manager;
pub(crate) mod pumps;
pub(crate) mod reconnection;
pub mod session;
pub mod transport;
pub mod types;

pub use error::{ConnectionError, TransportError};
pub use manager::{ConnectionManager, Reconfigured};
pub use session::{Session, SessionAction};
pub use transport::{Connector, OpenRequest, TaggedEvent, TransportEvent, TransportHandle, WsConnector};
pub use types::{
    ConnectionEvent, ConnectionParams, ConnectionPhase, DisconnectReason, ReconnectConfig,
    SessionId, generate_client_id,
};
