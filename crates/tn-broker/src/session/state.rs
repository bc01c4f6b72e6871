//! Session lifecycle states

use std::fmt;

use serde::Serialize;
use tn_protocol::GoAwayCode;

/// Lifecycle of an agent session.
///
/// `Connecting -> Authenticating -> Active -> Draining -> Closed`, with
/// `Authenticating -> Closed` when the credential is rejected and
/// `Authenticating -> Draining` when the broker stops before registration.
///
/// A [`Session`](super::Session) only exists once the agent is admitted and
/// starts in `Authenticating`. Before that the connection handler tracks
/// `Connecting` and the rejected `Authenticating -> Closed` path itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// TCP accepted, nothing received yet
    Connecting,
    /// Handshake in progress or credential accepted but not yet registered
    Authenticating,
    /// Registered and routable
    Active,
    /// Being torn down; no new streams
    Draining,
    /// Removed from the registry and fully closed
    Closed,
}

impl SessionState {
    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Authenticating)
                | (Connecting, Closed)
                | (Authenticating, Active)
                | (Authenticating, Draining)
                | (Authenticating, Closed)
                | (Active, Draining)
                | (Draining, Closed)
        )
    }

    pub fn is_closed(self) -> bool {
        self == SessionState::Closed
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Authenticating => write!(f, "authenticating"),
            SessionState::Active => write!(f, "active"),
            SessionState::Draining => write!(f, "draining"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// Why a session left `Active`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainReason {
    /// The physical connection failed
    ConnectionLost,
    /// No ping within the grace window
    HeartbeatTimeout,
    /// The agent said goodbye
    Logout,
    /// A newer session registered the same identity
    Replaced,
    /// The broker is shutting down
    Shutdown,
    /// The agent broke the framing protocol
    ProtocolError,
}

impl DrainReason {
    /// Code announced to the agent when draining
    pub fn go_away_code(self) -> GoAwayCode {
        match self {
            DrainReason::ConnectionLost | DrainReason::Logout => GoAwayCode::Normal,
            DrainReason::HeartbeatTimeout => GoAwayCode::HeartbeatTimeout,
            DrainReason::Replaced => GoAwayCode::Replaced,
            DrainReason::Shutdown => GoAwayCode::Shutdown,
            DrainReason::ProtocolError => GoAwayCode::ProtocolError,
        }
    }
}

impl fmt::Display for DrainReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DrainReason::ConnectionLost => write!(f, "connection lost"),
            DrainReason::HeartbeatTimeout => write!(f, "heartbeat timeout"),
            DrainReason::Logout => write!(f, "logout"),
            DrainReason::Replaced => write!(f, "replaced"),
            DrainReason::Shutdown => write!(f, "shutdown"),
            DrainReason::ProtocolError => write!(f, "protocol error"),
        }
    }
}
