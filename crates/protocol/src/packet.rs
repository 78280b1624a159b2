//! MQTT control packets handled by the bridge.
//!
//! Outbound: CONNECT and SUBSCRIBE are encoded here. Inbound: every WebSocket
//! message is classified into a [`Packet`]; CONNACK and PUBLISH are decoded,
//! everything else (SUBACK, PINGRESP, garbage) becomes [`Packet::Unrecognized`].
//!
//! Classification never fails. A frame that is too short for its own declared
//! fields is `Unrecognized`, and callers treat that as noise.

use std::fmt;

use crate::codec::{
    decode_remaining_length, encode_remaining_length, read_mqtt_string, write_mqtt_string,
};
use crate::constants::{
    CONNACK_HEADER, CONNACK_REMAINING_LENGTH, CONNECT_HEADER, FLAG_CLEAN_SESSION, FLAG_PASSWORD,
    FLAG_USERNAME, PROTOCOL_LEVEL, PROTOCOL_NAME, PUBLISH_TYPE, SUBSCRIBE_HEADER,
};
use crate::error::CodecError;

/// Quality of service levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(CodecError::InvalidInput(format!("invalid QoS: {value}"))),
        }
    }
}

/// CONNACK return codes (MQTT 3.1.1, section 3.2.2.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnackCode {
    Accepted,
    UnacceptableProtocolVersion,
    IdentifierRejected,
    ServerUnavailable,
    BadUsernameOrPassword,
    NotAuthorized,
    /// Codes 6..=255 are reserved by the protocol.
    Reserved(u8),
}

impl ConnackCode {
    /// Returns `true` if the broker accepted the session.
    pub fn is_accepted(self) -> bool {
        self == ConnackCode::Accepted
    }

    /// Returns the raw return code byte.
    pub fn as_u8(self) -> u8 {
        match self {
            ConnackCode::Accepted => 0,
            ConnackCode::UnacceptableProtocolVersion => 1,
            ConnackCode::IdentifierRejected => 2,
            ConnackCode::ServerUnavailable => 3,
            ConnackCode::BadUsernameOrPassword => 4,
            ConnackCode::NotAuthorized => 5,
            ConnackCode::Reserved(code) => code,
        }
    }
}

impl From<u8> for ConnackCode {
    fn from(code: u8) -> Self {
        match code {
            0 => ConnackCode::Accepted,
            1 => ConnackCode::UnacceptableProtocolVersion,
            2 => ConnackCode::IdentifierRejected,
            3 => ConnackCode::ServerUnavailable,
            4 => ConnackCode::BadUsernameOrPassword,
            5 => ConnackCode::NotAuthorized,
            other => ConnackCode::Reserved(other),
        }
    }
}

impl fmt::Display for ConnackCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnackCode::Accepted => f.write_str("connection accepted"),
            ConnackCode::UnacceptableProtocolVersion => {
                f.write_str("connection refused: unacceptable protocol version")
            }
            ConnackCode::IdentifierRejected => f.write_str("connection refused: identifier rejected"),
            ConnackCode::ServerUnavailable => f.write_str("connection refused: server unavailable"),
            ConnackCode::BadUsernameOrPassword => {
                f.write_str("connection refused: bad user name or password")
            }
            ConnackCode::NotAuthorized => f.write_str("connection refused: not authorized"),
            ConnackCode::Reserved(code) => write!(f, "connection refused: reserved code {code}"),
        }
    }
}

/// An MQTT control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect {
        client_id: String,
        username: String,
        password: String,
        keep_alive: u16,
    },
    Connack {
        return_code: ConnackCode,
    },
    Subscribe {
        packet_id: u16,
        topic_filter: String,
        requested_qos: QoS,
    },
    Publish {
        topic: String,
        payload: Vec<u8>,
    },
    /// Anything the bridge does not act on, kept verbatim for logging.
    Unrecognized {
        raw: Vec<u8>,
    },
}

impl Packet {
    /// Encodes an outbound packet.
    ///
    /// Only `Connect` and `Subscribe` are ever sent by a client of this
    /// engine; the other variants are inbound-only.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        match self {
            Packet::Connect {
                client_id,
                username,
                password,
                keep_alive,
            } => encode_connect(client_id, username, password, *keep_alive),
            Packet::Subscribe {
                packet_id,
                topic_filter,
                requested_qos,
            } => encode_subscribe(*packet_id, topic_filter, *requested_qos),
            other => Err(CodecError::InvalidInput(format!(
                "{} packets are not encoded by this client",
                other.name()
            ))),
        }
    }

    /// Short packet name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Connect { .. } => "CONNECT",
            Packet::Connack { .. } => "CONNACK",
            Packet::Subscribe { .. } => "SUBSCRIBE",
            Packet::Publish { .. } => "PUBLISH",
            Packet::Unrecognized { .. } => "UNRECOGNIZED",
        }
    }
}

/// Prefixes `body` with its fixed header byte and Remaining Length.
fn frame(header: u8, body: &[u8]) -> Result<Vec<u8>, CodecError> {
    let remaining = encode_remaining_length(body.len())?;
    let mut out = Vec::with_capacity(1 + remaining.len() + body.len());
    out.push(header);
    out.extend_from_slice(&remaining);
    out.extend_from_slice(body);
    Ok(out)
}

/// Encodes a CONNECT packet with a clean session.
///
/// An empty `username` omits both credentials (a password without a user
/// name is not allowed by MQTT 3.1.1); an empty `password` omits only the
/// password. With both present the flags byte is `0xC2`.
pub fn encode_connect(
    client_id: &str,
    username: &str,
    password: &str,
    keep_alive_seconds: u16,
) -> Result<Vec<u8>, CodecError> {
    let has_username = !username.is_empty();
    let has_password = has_username && !password.is_empty();

    let mut flags = FLAG_CLEAN_SESSION;
    if has_username {
        flags |= FLAG_USERNAME;
    }
    if has_password {
        flags |= FLAG_PASSWORD;
    }

    let mut body = Vec::with_capacity(16 + client_id.len() + username.len() + password.len());
    write_mqtt_string(&mut body, PROTOCOL_NAME)?;
    body.push(PROTOCOL_LEVEL);
    body.push(flags);
    body.extend_from_slice(&keep_alive_seconds.to_be_bytes());

    write_mqtt_string(&mut body, client_id)?;
    if has_username {
        write_mqtt_string(&mut body, username)?;
    }
    if has_password {
        write_mqtt_string(&mut body, password)?;
    }

    frame(CONNECT_HEADER, &body)
}

/// Encodes a SUBSCRIBE packet for a single topic filter.
pub fn encode_subscribe(
    packet_id: u16,
    topic_filter: &str,
    requested_qos: QoS,
) -> Result<Vec<u8>, CodecError> {
    if packet_id == 0 {
        return Err(CodecError::InvalidInput(
            "SUBSCRIBE packet identifier must be non-zero".into(),
        ));
    }

    let mut body = Vec::with_capacity(2 + 2 + topic_filter.len() + 1);
    body.extend_from_slice(&packet_id.to_be_bytes());
    write_mqtt_string(&mut body, topic_filter)?;
    body.push(requested_qos as u8);

    frame(SUBSCRIBE_HEADER, &body)
}

/// Classifies the first packet in `buf`.
pub fn classify(buf: &[u8]) -> Packet {
    decode_frame(buf).0
}

/// Decodes the first packet in `buf`.
///
/// Returns the packet and the number of bytes it occupied. For a non-empty
/// buffer at least one byte is always consumed; a malformed frame consumes
/// the whole buffer.
pub fn decode_frame(buf: &[u8]) -> (Packet, usize) {
    let Some(&first) = buf.first() else {
        return (Packet::Unrecognized { raw: Vec::new() }, 0);
    };

    if first == CONNACK_HEADER && buf.len() >= 4 && buf[1] == CONNACK_REMAINING_LENGTH {
        let return_code = ConnackCode::from(buf[3]);
        return (Packet::Connack { return_code }, 4);
    }

    let Some((start, end)) = frame_bounds(buf) else {
        return (Packet::Unrecognized { raw: buf.to_vec() }, buf.len());
    };

    if first >> 4 == PUBLISH_TYPE
        && let Some(packet) = decode_publish(first & 0x0F, &buf[start..end])
    {
        return (packet, end);
    }

    (
        Packet::Unrecognized {
            raw: buf[..end].to_vec(),
        },
        end,
    )
}

/// Returns the `(body_start, frame_end)` offsets of the first frame, or
/// `None` when the buffer is shorter than the declared remaining length.
fn frame_bounds(buf: &[u8]) -> Option<(usize, usize)> {
    let (remaining, len_bytes) = decode_remaining_length(buf.get(1..)?).ok()?;
    let start = 1 + len_bytes;
    let end = start.checked_add(remaining)?;
    (end <= buf.len()).then_some((start, end))
}

/// Decodes a PUBLISH body (everything after the fixed header).
fn decode_publish(flags: u8, body: &[u8]) -> Option<Packet> {
    let (topic, mut offset) = read_mqtt_string(body).ok()?;

    // QoS 1/2 frames carry a packet identifier after the topic.
    let qos = (flags >> 1) & 0x03;
    if qos > 0 {
        offset += 2;
    }

    let payload = body.get(offset..)?.to_vec();
    Some(Packet::Publish { topic, payload })
}

/// Iterator over the packets packed into one inbound message.
///
/// Once a frame fails to parse, the unparsed rest is yielded once as
/// [`Packet::Unrecognized`] and iteration stops.
pub struct Frames<'a> {
    buf: &'a [u8],
}

impl Iterator for Frames<'_> {
    type Item = Packet;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            return None;
        }
        let (packet, consumed) = decode_frame(self.buf);
        self.buf = &self.buf[consumed.min(self.buf.len())..];
        Some(packet)
    }
}

/// Splits an inbound message into its packets.
pub fn split_frames(buf: &[u8]) -> Frames<'_> {
    Frames { buf }
}
