//! Global broker state

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tn_core::config::BrokerConfig;
use tn_core::SessionId;
use tn_protocol::MuxConfig;

use crate::auth::Authenticator;
use crate::metrics::BrokerMetrics;
use crate::registry::SessionRegistry;
use crate::router::{RouterConfig, StreamRouter};
use crate::session::HeartbeatMonitor;

/// Everything the listener, the edge and the admin endpoint share
pub struct BrokerState {
    /// Configuration
    pub config: BrokerConfig,
    /// Identity -> session map
    pub registry: Arc<SessionRegistry>,
    /// Credential check for incoming agents
    pub authenticator: Arc<dyn Authenticator>,
    /// Counters
    pub metrics: Arc<BrokerMetrics>,
    /// Caller -> agent bridge
    pub router: Arc<StreamRouter>,
    next_session_id: AtomicU64,
}

impl BrokerState {
    /// Create broker state around an authenticator
    pub fn new(config: BrokerConfig, authenticator: Arc<dyn Authenticator>) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let metrics = Arc::new(BrokerMetrics::new());
        let router = Arc::new(StreamRouter::new(
            Arc::clone(&registry),
            Arc::clone(&metrics),
            RouterConfig::from(&config),
        ));
        Self {
            config,
            registry,
            authenticator,
            metrics,
            router,
            next_session_id: AtomicU64::new(1),
        }
    }

    /// Allocate a session id, unique for the life of the process
    pub fn next_session_id(&self) -> SessionId {
        SessionId::new(self.next_session_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Multiplexer settings for agent sessions
    pub fn mux_config(&self) -> MuxConfig {
        MuxConfig {
            max_streams: self.config.max_streams_per_session as usize,
            initial_window: self.config.stream_window,
            ..MuxConfig::default()
        }
    }

    pub fn heartbeat(&self) -> HeartbeatMonitor {
        HeartbeatMonitor::new(
            self.config.heartbeat_interval,
            self.config.heartbeat_grace(),
        )
    }
}
