//! tn-protocol: Wire protocol and stream multiplexer for the tunnel broker
//!
//! This crate defines the binary framing spoken between the broker and its
//! agents, the handshake messages exchanged before a session starts, and
//! the multiplexer that carries many virtual streams over one connection.

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod mux;
pub mod stream_id;

pub use codec::{Frame, FrameCodec};
pub use error::ProtocolError;
pub use frame::{FrameHeader, FrameType, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use message::{
    is_compatible_version, ClientInfo, GoAwayCode, Hello, HelloAck, ResetCode, PROTOCOL_VERSION,
    REJECT_AT_CAPACITY,
};
pub use mux::{MuxConfig, MuxError, MuxStats, Multiplexer, Role, Stream};
pub use stream_id::StreamId;
