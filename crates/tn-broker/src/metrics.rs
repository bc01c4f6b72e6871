//! Broker-wide counters

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic counters updated by the handler, the router and the edge
#[derive(Debug, Default)]
pub struct BrokerMetrics {
    sessions_registered: AtomicU64,
    sessions_replaced: AtomicU64,
    sessions_closed: AtomicU64,
    handshake_failures: AtomicU64,
    auth_failures: AtomicU64,
    handshake_timeouts: AtomicU64,
    streams_routed: AtomicU64,
    route_rejections: AtomicU64,
    route_interruptions: AtomicU64,
    bytes_to_agent: AtomicU64,
    bytes_to_caller: AtomicU64,
}

/// Serializable view of [`BrokerMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub active_sessions: usize,
    pub sessions_registered: u64,
    pub sessions_replaced: u64,
    pub sessions_closed: u64,
    pub handshake_failures: u64,
    pub auth_failures: u64,
    pub handshake_timeouts: u64,
    pub streams_routed: u64,
    pub route_rejections: u64,
    pub route_interruptions: u64,
    pub bytes_to_agent: u64,
    pub bytes_to_caller: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl BrokerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_registered(&self, replaced: bool) {
        bump(&self.sessions_registered);
        if replaced {
            bump(&self.sessions_replaced);
        }
    }

    pub fn session_closed(&self) {
        bump(&self.sessions_closed);
    }

    pub fn handshake_failed(&self) {
        bump(&self.handshake_failures);
    }

    pub fn auth_failed(&self) {
        bump(&self.auth_failures);
    }

    pub fn handshake_timed_out(&self) {
        bump(&self.handshake_timeouts);
    }

    /// A route got its stream to the agent
    pub fn route_opened(&self) {
        bump(&self.streams_routed);
    }

    /// A route finished; `completed` is false when it was interrupted
    pub fn route_finished(&self, to_agent: u64, to_caller: u64, completed: bool) {
        if !completed {
            bump(&self.route_interruptions);
        }
        self.bytes_to_agent.fetch_add(to_agent, Ordering::Relaxed);
        self.bytes_to_caller.fetch_add(to_caller, Ordering::Relaxed);
    }

    pub fn route_rejected(&self) {
        bump(&self.route_rejections);
    }

    pub fn snapshot(&self, active_sessions: usize) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            active_sessions,
            sessions_registered: load(&self.sessions_registered),
            sessions_replaced: load(&self.sessions_replaced),
            sessions_closed: load(&self.sessions_closed),
            handshake_failures: load(&self.handshake_failures),
            auth_failures: load(&self.auth_failures),
            handshake_timeouts: load(&self.handshake_timeouts),
            streams_routed: load(&self.streams_routed),
            route_rejections: load(&self.route_rejections),
            route_interruptions: load(&self.route_interruptions),
            bytes_to_agent: load(&self.bytes_to_agent),
            bytes_to_caller: load(&self.bytes_to_caller),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = BrokerMetrics::new();
        metrics.session_registered(false);
        metrics.session_registered(true);
        metrics.route_opened();
        metrics.route_opened();
        metrics.route_opened();
        metrics.route_finished(10, 20, true);
        metrics.route_finished(1, 0, false);
        metrics.route_rejected();

        let snapshot = metrics.snapshot(1);
        assert_eq!(snapshot.active_sessions, 1);
        assert_eq!(snapshot.sessions_registered, 2);
        assert_eq!(snapshot.sessions_replaced, 1);
        assert_eq!(snapshot.streams_routed, 3);
        assert_eq!(snapshot.route_interruptions, 1);
        assert_eq!(snapshot.route_rejections, 1);
        assert_eq!(snapshot.bytes_to_agent, 11);
        assert_eq!(snapshot.bytes_to_caller, 20);
    }
}
