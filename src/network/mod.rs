//! Network Module Implementation
//!
//! Wire-level building blocks shared by every connection the manager owns.
//!
//! # Components
//!
//! - `frame`: the 8 byte message header plus payload, with an incremental
//!   decoder for non-blocking sockets
//! - `handshake`: the fixed 24 byte preamble exchanged right after connect
//! - `address`: `protocol://host:port` parsing and resolution
//! - `socket`: non-blocking connect, listener setup, keepalive, shutdown

pub use address::{NetAddress, Protocol};
pub use frame::{
    write_message, Message, MessageHeader, MessageReader, ReadStatus, TryRead, HEADER_SIZE,
};
pub use handshake::{
    write_preamble, ChannelPurpose, PeerId, Preamble, PreambleReader, PREAMBLE_SIZE,
    PROTOCOL_VERSION, SIGNATURE,
};

mod address;
mod frame;
mod handshake;
pub mod socket;
