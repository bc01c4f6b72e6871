//! Multiplexer error types

use std::io;

use thiserror::Error;

use crate::message::ResetCode;

/// Errors surfaced by the multiplexer and its streams.
///
/// `Clone` so a single terminal reason can be handed to every stream of a
/// failed connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MuxError {
    /// Operation attempted after the session began closing
    #[error("Session closed")]
    SessionClosed,

    /// The physical connection failed
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The stream limit was reached (locally or refused by the peer)
    #[error("Stream limit exceeded")]
    StreamLimitExceeded,

    /// The stream was aborted
    #[error("Stream reset: {0}")]
    StreamReset(ResetCode),

    /// Peer violated the framing protocol
    #[error("Protocol violation: {0}")]
    Protocol(String),
}

impl MuxError {
    /// Whether the error ends the whole multiplexer rather than one stream
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MuxError::SessionClosed | MuxError::ConnectionLost(_) | MuxError::Protocol(_)
        )
    }

    fn io_kind(&self) -> io::ErrorKind {
        match self {
            MuxError::SessionClosed => io::ErrorKind::NotConnected,
            MuxError::ConnectionLost(_) => io::ErrorKind::ConnectionAborted,
            MuxError::StreamLimitExceeded => io::ErrorKind::ConnectionRefused,
            MuxError::StreamReset(_) => io::ErrorKind::ConnectionReset,
            MuxError::Protocol(_) => io::ErrorKind::InvalidData,
        }
    }
}

/// Stream I/O errors keep the `MuxError` as their inner error so callers can
/// recover it with `get_ref()` and `downcast_ref::<MuxError>()`.
impl From<MuxError> for io::Error {
    fn from(err: MuxError) -> Self {
        io::Error::new(err.io_kind(), err)
    }
}
