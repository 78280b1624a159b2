//! TCP wire format for the relay link.
//!
//! # Wire format
//!
//! ```text
//! FRAME (Bridge -> Companion):
//!   [1 byte: kind, 0x01=MESSAGE, 0x02=CONTEXT]
//!   [2 bytes BE: payload_len]
//!   [payload_len bytes: payload UTF-8]
//! ```
//!
//! MESSAGE frames carry a payload delivered while the link was up.
//! CONTEXT frames carry the last-known value stored while it was down.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::RelayError;

/// Frame kind byte: live message.
pub const KIND_MESSAGE: u8 = 0x01;

/// Frame kind byte: stored last-known value.
pub const KIND_CONTEXT: u8 = 0x02;

/// Largest payload a frame can carry.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// How a payload reached the companion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Message,
    Context,
}

impl FrameKind {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Message => KIND_MESSAGE,
            Self::Context => KIND_CONTEXT,
        }
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = RelayError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            KIND_MESSAGE => Ok(Self::Message),
            KIND_CONTEXT => Ok(Self::Context),
            other => Err(RelayError::Protocol(format!(
                "unknown frame kind 0x{other:02X}"
            ))),
        }
    }
}

/// One frame on the relay link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayFrame {
    pub kind: FrameKind,
    pub payload: String,
}

/// Writes a frame to the stream. The caller flushes.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &RelayFrame,
) -> Result<(), RelayError> {
    let payload = frame.payload.as_bytes();
    let len = payload.len();
    if len > MAX_PAYLOAD_LEN {
        return Err(RelayError::Protocol(format!(
            "payload too long: {len} bytes (max {MAX_PAYLOAD_LEN})"
        )));
    }

    writer.write_u8(frame.kind.as_u8()).await?;
    writer.write_u16(len as u16).await?;
    writer.write_all(payload).await?;
    Ok(())
}

/// Reads a frame from the stream.
///
/// Returns `None` if the stream ends cleanly between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<RelayFrame>, RelayError> {
    let kind = match reader.read_u8().await {
        Ok(byte) => FrameKind::try_from(byte)?,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let len = reader.read_u16().await?;
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    let payload = String::from_utf8(buf)
        .map_err(|e| RelayError::Protocol(format!("invalid UTF-8 payload: {e}")))?;

    Ok(Some(RelayFrame { kind, payload }))
}
