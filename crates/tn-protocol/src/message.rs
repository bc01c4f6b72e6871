//! Handshake messages and control codes
//!
//! The handshake runs on stream 0 before the multiplexer starts:
//!
//! 1. Agent connects and sends `Hello` with its credential
//! 2. Broker authenticates and responds with `HelloAck`
//! 3. On acceptance both sides switch to multiplexed streams; the agent
//!    pings at the advertised heartbeat interval
//! 4. Either side may end the session with a `GoAway` frame
//!
//! # Protocol Version
//!
//! `Hello::version` carries "MAJOR.MINOR". The broker rejects agents whose
//! major version differs from its own.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Current protocol version string.
pub const PROTOCOL_VERSION: &str = "1.0";

/// `HelloAck::reason` when the broker has no room for another session.
///
/// The only rejection an agent should retry.
pub const REJECT_AT_CAPACITY: &str = "broker at capacity";

/// Whether a peer-reported version can talk to this implementation
pub fn is_compatible_version(version: &str) -> bool {
    fn major(v: &str) -> Option<&str> {
        v.split('.').next().filter(|m| !m.is_empty())
    }
    major(version).is_some() && major(version) == major(PROTOCOL_VERSION)
}

/// Reason attached to a stream `Reset`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ResetCode {
    /// Stream abandoned by its owner
    Cancel = 0,
    /// Open refused: stream limit or accept backlog reached
    Refused = 1,
    /// Peer violated the stream protocol
    ProtocolError = 2,
    /// Peer sent more data than the advertised window
    FlowControl = 3,
}

impl ResetCode {
    /// Convert to u16
    pub fn as_u16(&self) -> u16 {
        *self as u16
    }

    /// Convert from u16
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::Cancel),
            1 => Some(Self::Refused),
            2 => Some(Self::ProtocolError),
            3 => Some(Self::FlowControl),
            _ => None,
        }
    }
}

impl fmt::Display for ResetCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResetCode::Cancel => write!(f, "cancel"),
            ResetCode::Refused => write!(f, "refused"),
            ResetCode::ProtocolError => write!(f, "protocol error"),
            ResetCode::FlowControl => write!(f, "flow control"),
        }
    }
}

/// Reason attached to a session `GoAway`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum GoAwayCode {
    /// Orderly close (agent logout or local close)
    Normal = 0,
    /// Peer violated the framing protocol
    ProtocolError = 1,
    /// A newer session registered the same identity
    Replaced = 2,
    /// No heartbeat within the grace window
    HeartbeatTimeout = 3,
    /// Broker is shutting down
    Shutdown = 4,
}

impl GoAwayCode {
    /// Convert to u16
    pub fn as_u16(&self) -> u16 {
        *self as u16
    }

    /// Convert from u16
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::Normal),
            1 => Some(Self::ProtocolError),
            2 => Some(Self::Replaced),
            3 => Some(Self::HeartbeatTimeout),
            4 => Some(Self::Shutdown),
            _ => None,
        }
    }
}

impl fmt::Display for GoAwayCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GoAwayCode::Normal => write!(f, "normal"),
            GoAwayCode::ProtocolError => write!(f, "protocol error"),
            GoAwayCode::Replaced => write!(f, "replaced by newer session"),
            GoAwayCode::HeartbeatTimeout => write!(f, "heartbeat timeout"),
            GoAwayCode::Shutdown => write!(f, "broker shutdown"),
        }
    }
}

/// Description of the connecting agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Hostname of the agent machine
    pub hostname: String,
    /// Operating system (e.g., "linux", "macos", "windows")
    pub os: String,
    /// CPU architecture (e.g., "x86_64", "aarch64")
    pub arch: String,
    /// Agent software version
    pub agent_version: String,
}

impl ClientInfo {
    /// Describe the current process
    pub fn local(hostname: impl Into<String>, agent_version: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            agent_version: agent_version.into(),
        }
    }
}

/// Handshake request sent by the agent
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Protocol version, see [`PROTOCOL_VERSION`]
    pub version: String,
    /// Credential handed to the authenticator (e.g., an API key)
    pub credential: String,
    /// Agent description
    pub client: ClientInfo,
}

impl Hello {
    /// Build a hello for the current protocol version
    pub fn new(credential: impl Into<String>, client: ClientInfo) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            credential: credential.into(),
            client,
        }
    }
}

// Credentials never reach the logs
impl fmt::Debug for Hello {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hello")
            .field("version", &self.version)
            .field("credential", &"<redacted>")
            .field("client", &self.client)
            .finish()
    }
}

/// Handshake response sent by the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloAck {
    /// Whether the session was admitted
    pub accepted: bool,
    /// Identity the broker registered the session under
    pub identity: Option<String>,
    /// Reason if not accepted
    pub reason: Option<String>,
    /// Interval at which the broker expects pings, in milliseconds
    pub heartbeat_interval_ms: u64,
    /// Initial per-stream receive window both sides use
    pub window_size: u32,
    /// Maximum concurrent streams the broker accepts on this session
    pub max_streams: u32,
}

impl HelloAck {
    /// Whether a rejection is worth retrying later
    pub fn is_transient_rejection(&self) -> bool {
        !self.accepted && self.reason.as_deref() == Some(REJECT_AT_CAPACITY)
    }

    /// Build a rejection
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            identity: None,
            reason: Some(reason.into()),
            heartbeat_interval_ms: 0,
            window_size: 0,
            max_streams: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_code_roundtrip() {
        for code in [
            ResetCode::Cancel,
            ResetCode::Refused,
            ResetCode::ProtocolError,
            ResetCode::FlowControl,
        ] {
            assert_eq!(ResetCode::from_u16(code.as_u16()), Some(code));
        }
        assert_eq!(ResetCode::from_u16(99), None);
    }

    #[test]
    fn test_go_away_code_roundtrip() {
        for code in [
            GoAwayCode::Normal,
            GoAwayCode::ProtocolError,
            GoAwayCode::Replaced,
            GoAwayCode::HeartbeatTimeout,
            GoAwayCode::Shutdown,
        ] {
            assert_eq!(GoAwayCode::from_u16(code.as_u16()), Some(code));
        }
    }

    #[test]
    fn test_version_compatibility() {
        assert!(is_compatible_version("1.0"));
        assert!(is_compatible_version("1.7"));
        assert!(!is_compatible_version("2.0"));
        assert!(!is_compatible_version(""));
    }

    #[test]
    fn test_only_capacity_rejection_is_transient() {
        assert!(HelloAck::rejected(REJECT_AT_CAPACITY).is_transient_rejection());
        assert!(!HelloAck::rejected("invalid credential").is_transient_rejection());
    }

    #[test]
    fn test_hello_debug_redacts_credential() {
        let hello = Hello::new("ak_1234.secret", ClientInfo::default());
        let rendered = format!("{:?}", hello);
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
