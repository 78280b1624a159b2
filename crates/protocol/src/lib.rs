//! MQTT 3.1.1 frame codec.
//!
//! Pure functions only: encoding of the outbound packets the bridge sends
//! (CONNECT, SUBSCRIBE) and classification of inbound WebSocket messages into
//! packets (CONNACK, PUBLISH, anything else). No I/O and no session state.

pub mod codec;
pub mod constants;
pub mod error;
pub mod packet;

pub use codec::{
    decode_remaining_length, encode_remaining_length, hex_dump, read_mqtt_string,
    write_mqtt_string,
};
pub use error::CodecError;
pub use packet::{
    ConnackCode, Frames, Packet, QoS, classify, decode_frame, encode_connect, encode_subscribe,
    split_frames,
};
