//! MQTT 3.1.1 wire constants used by the bridge.

/// Protocol name carried in the CONNECT variable header.
pub const PROTOCOL_NAME: &str = "MQTT";

/// Protocol level for MQTT 3.1.1.
pub const PROTOCOL_LEVEL: u8 = 0x04;

/// WebSocket subprotocol brokers expect for MQTT traffic.
pub const WS_SUBPROTOCOL: &str = "mqtt";

/// Fixed header byte of a CONNECT packet.
pub const CONNECT_HEADER: u8 = 0x10;

/// Fixed header byte of a CONNACK packet.
pub const CONNACK_HEADER: u8 = 0x20;

/// Remaining length of every MQTT 3.1.1 CONNACK.
pub const CONNACK_REMAINING_LENGTH: u8 = 0x02;

/// Fixed header byte of a SUBSCRIBE packet (reserved flags `0b0010`).
pub const SUBSCRIBE_HEADER: u8 = 0x82;

/// Packet type nibble of PUBLISH.
pub const PUBLISH_TYPE: u8 = 0x3;

/// CONNECT flag: user name present.
pub const FLAG_USERNAME: u8 = 0x80;

/// CONNECT flag: password present.
pub const FLAG_PASSWORD: u8 = 0x40;

/// CONNECT flag: clean session.
pub const FLAG_CLEAN_SESSION: u8 = 0x02;

/// Largest value the Remaining Length field can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Remaining Length never spans more than this many bytes.
pub const MAX_REMAINING_LENGTH_BYTES: usize = 4;

/// Longest UTF-8 string an MQTT string prefix can describe.
pub const MAX_STRING_LEN: usize = u16::MAX as usize;

/// Keep-alive the bridge advertises in CONNECT, in seconds.
pub const DEFAULT_KEEP_ALIVE: u16 = 60;
