//! Error taxonomy shared by the broker and the agent

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tn_protocol::{MuxError, ProtocolError, ResetCode};

use crate::types::ClientIdentity;

/// Which deadline expired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Hello/HelloAck exchange
    Handshake,
    /// No ping within the heartbeat grace window
    Heartbeat,
    /// Opening a stream to the agent
    Dial,
    /// No bytes in either direction of a routed stream
    Idle,
    /// Total lifetime cap of a routed stream
    Lifetime,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutKind::Handshake => write!(f, "handshake"),
            TimeoutKind::Heartbeat => write!(f, "heartbeat"),
            TimeoutKind::Dial => write!(f, "dial"),
            TimeoutKind::Idle => write!(f, "idle"),
            TimeoutKind::Lifetime => write!(f, "lifetime"),
        }
    }
}

/// Top-level error type for the tunnel
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Credential rejected
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// The physical connection failed
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Operation on a session that is closing or closed
    #[error("Session closed")]
    SessionClosed,

    /// No active session for the identity
    #[error("No active tunnel for {0}")]
    NoActiveTunnel(ClientIdentity),

    /// The agent refused or the session is at its stream limit
    #[error("Stream limit exceeded")]
    StreamLimitExceeded,

    /// A single stream was aborted
    #[error("Stream reset: {0}")]
    StreamReset(ResetCode),

    /// A deadline expired
    #[error("{0} timeout")]
    Timeout(TimeoutKind),

    /// Wire protocol violation
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl TunnelError {
    /// Classify a stream I/O error, recovering the multiplexer error if the
    /// stream produced it
    pub fn from_io(err: io::Error) -> Self {
        let mux = err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<MuxError>())
            .cloned();
        match mux {
            Some(mux) => mux.into(),
            None => TunnelError::Io(err),
        }
    }

    /// Whether the error ended the whole session rather than one operation
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            TunnelError::ConnectionLost(_)
                | TunnelError::SessionClosed
                | TunnelError::Protocol(_)
                | TunnelError::Timeout(TimeoutKind::Heartbeat)
        )
    }
}

impl From<MuxError> for TunnelError {
    fn from(err: MuxError) -> Self {
        match err {
            MuxError::SessionClosed => TunnelError::SessionClosed,
            MuxError::ConnectionLost(reason) => TunnelError::ConnectionLost(reason),
            MuxError::StreamLimitExceeded => TunnelError::StreamLimitExceeded,
            MuxError::StreamReset(code) => TunnelError::StreamReset(code),
            MuxError::Protocol(reason) => TunnelError::Protocol(reason),
        }
    }
}

impl From<ProtocolError> for TunnelError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => TunnelError::ConnectionLost(e.to_string()),
            other => TunnelError::Protocol(other.to_string()),
        }
    }
}

impl From<io::Error> for TunnelError {
    fn from(err: io::Error) -> Self {
        TunnelError::from_io(err)
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
