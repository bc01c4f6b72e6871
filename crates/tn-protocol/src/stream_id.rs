//! Stream identifier type

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a virtual stream, unique only within its multiplexer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(pub u32);

impl StreamId {
    /// Create a new stream ID
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Reserved ID for session-level frames (ping, pong, go-away, handshake)
    pub const SESSION: StreamId = StreamId(0);

    /// Whether this is the reserved session-level ID
    pub fn is_session(&self) -> bool {
        self.0 == 0
    }

    /// Whether the ID was allocated by the client (agent) side.
    ///
    /// Clients allocate odd IDs, servers allocate even IDs.
    pub fn is_client_initiated(&self) -> bool {
        self.0 % 2 == 1
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

impl From<u32> for StreamId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}
