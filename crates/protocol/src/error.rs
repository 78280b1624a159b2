//! Error types for the frame codec.

/// Errors produced while encoding or decoding MQTT frames.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The caller passed a value the wire format cannot represent.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The buffer ended before the field was complete.
    #[error("incomplete frame")]
    Incomplete,

    #[error("malformed frame: {0}")]
    Malformed(String),
}
