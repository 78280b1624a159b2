//! Error types for the connection engine.

use watchmqtt_protocol::ConnackCode;

/// Errors surfaced by [`ConnectionManager`](crate::ConnectionManager) calls.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("broker refused the connection: {0}")]
    ProtocolRefusal(ConnackCode),

    #[error("not connected")]
    NotConnected,

    #[error("connection manager stopped")]
    Stopped,
}

/// Errors produced by a transport handle or its handshake.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("{0}")]
    Failed(String),

    #[error("transport closed")]
    Closed,

    #[error("send queue full")]
    Backpressure,
}
