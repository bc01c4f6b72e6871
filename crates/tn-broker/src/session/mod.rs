//! Agent sessions
//!
//! A [`Session`] ties an authenticated identity to the multiplexer of its
//! physical connection and tracks the lifecycle in a watch channel so the
//! registry, the router and the admin endpoint all see the same state.

mod heartbeat;
mod state;

use std::net::SocketAddr;
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;

use tn_core::time::current_time_millis;
use tn_core::{ClientIdentity, SessionId, TunnelError};
use tn_protocol::{ClientInfo, Multiplexer, Stream};

pub use heartbeat::HeartbeatMonitor;
pub use state::{DrainReason, SessionState};

/// One agent connection registered under an identity
pub struct Session {
    id: SessionId,
    identity: ClientIdentity,
    client: ClientInfo,
    peer_addr: SocketAddr,
    mux: Multiplexer,
    is_admin: bool,
    /// Unix milliseconds
    created_at: u64,
    started: Instant,
    state_tx: watch::Sender<SessionState>,
    drain_reason: Mutex<Option<DrainReason>>,
}

impl Session {
    /// Wrap an authenticated connection. The session starts in
    /// `Authenticating` until the registry activates it.
    pub fn new(
        id: SessionId,
        identity: ClientIdentity,
        client: ClientInfo,
        peer_addr: SocketAddr,
        mux: Multiplexer,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Authenticating);
        Self {
            id,
            identity,
            client,
            peer_addr,
            mux,
            is_admin: false,
            created_at: current_time_millis(),
            started: Instant::now(),
            state_tx,
            drain_reason: Mutex::new(None),
        }
    }

    /// Mark the session as owned by an admin key
    pub fn with_admin(mut self, is_admin: bool) -> Self {
        self.is_admin = is_admin;
        self
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn is_admin(&self) -> bool {
        self.is_admin
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn client(&self) -> &ClientInfo {
        &self.client
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn mux(&self) -> &Multiplexer {
        &self.mux
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// First recorded drain reason
    pub fn drain_reason(&self) -> Option<DrainReason> {
        *self.drain_reason.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move to `Active`. Fails if the session already began draining.
    pub fn activate(&self) -> Result<(), TunnelError> {
        let mut result = Ok(());
        self.state_tx.send_if_modified(|state| match *state {
            SessionState::Authenticating | SessionState::Connecting => {
                *state = SessionState::Active;
                true
            }
            SessionState::Active => false,
            SessionState::Draining | SessionState::Closed => {
                result = Err(TunnelError::SessionClosed);
                false
            }
        });
        result
    }

    /// Stop routing to this session and close its multiplexer with the
    /// matching `GoAway`. The first reason wins; returns false if the
    /// session was already draining or closed.
    pub fn drain(&self, reason: DrainReason) -> bool {
        let started = self.state_tx.send_if_modified(|state| {
            if state.can_transition_to(SessionState::Draining) {
                *state = SessionState::Draining;
                true
            } else {
                false
            }
        });
        if !started {
            return false;
        }

        {
            let mut recorded = self.drain_reason.lock().unwrap_or_else(|e| e.into_inner());
            recorded.get_or_insert(reason);
        }
        tracing::info!("Draining {} for {} ({})", self.id, self.identity, reason);
        self.mux.close_with(reason.go_away_code());
        true
    }

    /// Final transition after the session left the registry
    pub fn mark_closed(&self) {
        self.mux.close();
        self.state_tx.send_if_modified(|state| {
            if state.is_closed() {
                false
            } else {
                *state = SessionState::Closed;
                true
            }
        });
    }

    /// Wait until the session reaches `Closed`
    pub async fn wait_closed(&self) {
        let mut rx = self.state_tx.subscribe();
        let _ = rx.wait_for(|state| state.is_closed()).await;
    }

    /// Open a stream to the agent
    pub async fn open_stream(&self) -> Result<Stream, TunnelError> {
        if !self.is_active() {
            return Err(TunnelError::SessionClosed);
        }
        self.mux.open().await.map_err(TunnelError::from)
    }

    /// Time since the session was created
    pub fn age(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    /// Point-in-time view for the admin endpoint
    pub fn summary(&self) -> SessionSummary {
        let stats = self.mux.stats();
        SessionSummary {
            id: self.id.as_u64(),
            identity: self.identity.to_string(),
            state: self.state(),
            is_admin: self.is_admin,
            peer_addr: self.peer_addr.to_string(),
            hostname: self.client.hostname.clone(),
            agent_version: self.client.agent_version.clone(),
            created_at: self.created_at,
            age_secs: self.age().as_secs(),
            last_heartbeat_secs: self.mux.since_last_ping().as_secs(),
            bytes_in: stats.bytes_in,
            bytes_out: stats.bytes_out,
            open_streams: stats.open_streams,
            drain_reason: self.drain_reason(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("state", &self.state())
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

/// Serializable session summary
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: u64,
    pub identity: String,
    pub state: SessionState,
    pub is_admin: bool,
    pub peer_addr: String,
    pub hostname: String,
    pub agent_version: String,
    /// Unix milliseconds
    pub created_at: u64,
    pub age_secs: u64,
    /// Seconds since the agent last pinged
    pub last_heartbeat_secs: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub open_streams: usize,
    pub drain_reason: Option<DrainReason>,
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Arc;
    use tn_protocol::{MuxConfig, Role};

    /// A session over an in-memory connection plus the agent-side multiplexer
    pub(crate) fn session_pair(id: u64, identity: &str) -> (Arc<Session>, Multiplexer) {
        session_pair_with(id, identity, MuxConfig::default())
    }

    pub(crate) fn session_pair_with(
        id: u64,
        identity: &str,
        agent_config: MuxConfig,
    ) -> (Arc<Session>, Multiplexer) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let server = Multiplexer::new(a, Role::Server, MuxConfig::default());
        let agent = Multiplexer::new(b, Role::Client, agent_config);
        let session = Session::new(
            SessionId::new(id),
            ClientIdentity::new(identity),
            ClientInfo::local("test-host", "0.0.0"),
            "127.0.0.1:40000".parse().unwrap(),
            server,
        );
        (Arc::new(session), agent)
    }
}
