//! Heartbeat supervision

use std::time::Duration;

use tn_protocol::Multiplexer;

/// Decides when an agent has been silent for too long.
///
/// Agents ping every `interval`; a session is considered dead once no ping
/// arrived for `grace`.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatMonitor {
    /// Expected ping interval, advertised to agents
    pub interval: Duration,
    /// Silence tolerated before the session is drained
    pub grace: Duration,
}

impl HeartbeatMonitor {
    /// Create a new heartbeat monitor
    pub fn new(interval: Duration, grace: Duration) -> Self {
        Self { interval, grace }
    }

    /// Resolves once the peer of `mux` has not pinged for longer than the
    /// grace window. Counts from multiplexer start if it never pinged.
    pub async fn expired(&self, mux: &Multiplexer) {
        loop {
            let silent = mux.since_last_ping();
            if silent >= self.grace {
                return;
            }
            tokio::time::sleep(self.grace - silent).await;
        }
    }
}
