//! Protocol error types

use thiserror::Error;

use crate::frame::FrameType;

/// Errors that can occur during protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Unknown frame type
    #[error("Unknown frame type: {0:#04x}")]
    UnknownFrameType(u8),

    /// Payload exceeds maximum size
    #[error("Payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Fixed-size payload had the wrong length
    #[error("Invalid {frame_type:?} payload: expected {expected} bytes, got {actual}")]
    InvalidPayloadLength {
        frame_type: FrameType,
        expected: usize,
        actual: usize,
    },

    /// Frame carried a stream ID that is not allowed for its type
    #[error("{frame_type:?} frame not allowed on stream {stream_id}")]
    InvalidStreamId { frame_type: FrameType, stream_id: u32 },

    /// Unknown reset or go-away code
    #[error("Unknown {kind} code: {code}")]
    UnknownCode { kind: &'static str, code: u16 },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
