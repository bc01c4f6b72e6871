//! HTTP admin endpoint
//!
//! Read-only JSON views of the broker: liveness, counters and the session
//! table.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::metrics::MetricsSnapshot;
use crate::session::SessionSummary;
use crate::state::BrokerState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub protocol_version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionSummary>,
    pub count: usize,
}

/// Build the admin router
pub fn create_router(state: Arc<BrokerState>) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics))
        .route("/sessions", get(list_sessions))
        .with_state(state)
}

/// Serve the admin endpoint until cancelled
pub async fn serve(addr: &str, state: Arc<BrokerState>, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind admin endpoint {}", addr))?;
    tracing::info!("Admin endpoint listening on http://{}", listener.local_addr()?);

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("Admin endpoint failed")
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        protocol_version: tn_protocol::PROTOCOL_VERSION,
    })
}

async fn metrics(State(state): State<Arc<BrokerState>>) -> Json<MetricsSnapshot> {
    let active = state
        .registry
        .list()
        .iter()
        .filter(|session| session.is_active())
        .count();
    Json(state.metrics.snapshot(active))
}

async fn list_sessions(State(state): State<Arc<BrokerState>>) -> Json<SessionListResponse> {
    let mut sessions: Vec<SessionSummary> = state
        .registry
        .list()
        .iter()
        .map(|session| session.summary())
        .collect();
    sessions.sort_by(|a, b| a.identity.cmp(&b.identity));

    Json(SessionListResponse {
        count: sessions.len(),
        sessions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tn_core::config::BrokerConfig;

    use crate::auth::ApiKeyAuthenticator;
    use crate::session::test_support::session_pair;
    use crate::session::SessionState;

    fn state() -> Arc<BrokerState> {
        Arc::new(BrokerState::new(
            BrokerConfig::default(),
            Arc::new(ApiKeyAuthenticator::new()),
        ))
    }

    #[tokio::test]
    async fn test_health() {
        let Json(body) = health().await;
        assert_eq!(body.status, "ok");
        assert_eq!(body.protocol_version, "1.0");
    }

    #[tokio::test]
    async fn test_sessions_and_metrics() {
        let state = state();
        let (a, _agent_a) = session_pair(1, "u2");
        let (b, _agent_b) = session_pair(2, "u1");
        state.registry.register(a).unwrap();
        state.registry.register(b).unwrap();
        state.metrics.session_registered(false);

        let Json(list) = list_sessions(State(Arc::clone(&state))).await;
        assert_eq!(list.count, 2);
        assert_eq!(list.sessions[0].identity, "u1");
        assert_eq!(list.sessions[0].state, SessionState::Active);
        assert_eq!(list.sessions[1].id, 1);

        let Json(snapshot) = metrics(State(Arc::clone(&state))).await;
        assert_eq!(snapshot.active_sessions, 2);
        assert_eq!(snapshot.sessions_registered, 1);

        let json = serde_json::to_value(&list).unwrap();
        assert_eq!(json["sessions"][0]["state"], "active");
    }
}
