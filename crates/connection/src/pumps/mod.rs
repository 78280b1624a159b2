//! Read and write halves of the WebSocket transport.

pub(crate) mod read;
pub(crate) mod write;
