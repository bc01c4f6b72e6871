//! Per-connection handler
//!
//! Drives one agent connection through its whole life: handshake,
//! registration, serving, and the drain/remove/close sequence at the end.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use tn_core::TunnelError;
use tn_protocol::{FrameCodec, MuxError, Multiplexer, Role};

use crate::server::handshake::{handshake, HandshakeError};
use crate::session::{DrainReason, Session, SessionState};
use crate::state::BrokerState;

/// Serve one agent connection until its session ends.
///
/// Returns an error only when the agent was never admitted; a session that
/// ran and ended for any reason is `Ok`.
pub async fn serve_connection<T>(
    io: T,
    peer_addr: SocketAddr,
    state: Arc<BrokerState>,
    cancel: CancellationToken,
) -> Result<(), TunnelError>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut phase = SessionState::Connecting;
    let mut framed = Framed::new(io, FrameCodec::new());
    advance(peer_addr, &mut phase, SessionState::Authenticating);

    let admitted = tokio::select! {
        _ = cancel.cancelled() => {
            advance(peer_addr, &mut phase, SessionState::Closed);
            return Err(TunnelError::SessionClosed);
        }
        result = handshake(&mut framed, &state) => result,
    };
    let admission = match admitted {
        Ok(admission) => admission,
        Err(err) => {
            record_rejection(&state, &err);
            advance(peer_addr, &mut phase, SessionState::Closed);
            tracing::warn!("Rejected agent from {}: {}", peer_addr, err);
            return Err(err.into());
        }
    };

    // From here on the session tracks its own state, starting in Authenticating
    let mux = Multiplexer::from_framed(framed, Role::Server, state.mux_config());
    let session = Arc::new(
        Session::new(
            state.next_session_id(),
            admission.identity,
            admission.client,
            peer_addr,
            mux,
        )
        .with_admin(admission.is_admin),
    );

    let replaced = state.registry.register(Arc::clone(&session))?;
    state.metrics.session_registered(replaced.is_some());
    tracing::info!(
        "{} active for {} from {} ({} {}/{})",
        session.id(),
        session.identity(),
        peer_addr,
        session.client().hostname,
        session.client().os,
        session.client().arch
    );

    let reason = serve(&session, &state, &cancel).await;
    session.drain(reason);
    state.registry.remove(session.identity(), &session);
    session.mark_closed();
    state.metrics.session_closed();

    tracing::info!(
        "{} for {} closed ({})",
        session.id(),
        session.identity(),
        session.drain_reason().unwrap_or(reason)
    );
    Ok(())
}

/// Wait for whatever ends the session first
async fn serve(session: &Session, state: &BrokerState, cancel: &CancellationToken) -> DrainReason {
    let heartbeat = state.heartbeat();
    let mux = session.mux();

    loop {
        tokio::select! {
            err = mux.closed() => return close_reason(session, err),
            _ = heartbeat.expired(mux) => {
                tracing::warn!(
                    "{} for {} missed heartbeats for {:?}",
                    session.id(),
                    session.identity(),
                    heartbeat.grace
                );
                return DrainReason::HeartbeatTimeout;
            }
            _ = cancel.cancelled() => return DrainReason::Shutdown,
            accepted = mux.accept() => match accepted {
                // Streams only flow broker -> agent
                Ok(stream) => {
                    tracing::debug!(
                        "Resetting agent-initiated {} on {}",
                        stream.id(),
                        session.id()
                    );
                    stream.reset();
                }
                Err(err) => return close_reason(session, err),
            },
        }
    }
}

fn close_reason(session: &Session, err: MuxError) -> DrainReason {
    if let Some(reason) = session.drain_reason() {
        return reason;
    }
    match err {
        MuxError::Protocol(_) => DrainReason::ProtocolError,
        MuxError::ConnectionLost(_) => DrainReason::ConnectionLost,
        _ if session.mux().remote_go_away().is_some() => DrainReason::Logout,
        _ => DrainReason::ConnectionLost,
    }
}

/// Step a not-yet-admitted connection through its lifecycle
fn advance(peer_addr: SocketAddr, phase: &mut SessionState, next: SessionState) {
    debug_assert!(
        phase.can_transition_to(next),
        "illegal transition {} -> {}",
        phase,
        next
    );
    tracing::trace!("Agent connection from {}: {} -> {}", peer_addr, phase, next);
    *phase = next;
}

fn record_rejection(state: &BrokerState, err: &HandshakeError) {
    state.metrics.handshake_failed();
    match err {
        HandshakeError::Timeout => state.metrics.handshake_timed_out(),
        HandshakeError::Auth(_) | HandshakeError::Unverified(_) => state.metrics.auth_failed(),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures::{SinkExt, StreamExt};
    use tn_core::config::BrokerConfig;
    use tn_protocol::{ClientInfo, Frame, GoAwayCode, Hello, MuxConfig};

    use crate::auth::{generate_api_key, ApiKeyAuthenticator};
    use crate::session::SessionSummary;
    use crate::session::SessionState;

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    fn broker(config: BrokerConfig) -> (Arc<BrokerState>, String) {
        let (key, entry) = generate_api_key("u1");
        let auth = ApiKeyAuthenticator::from_entries([entry]);
        (Arc::new(BrokerState::new(config, Arc::new(auth))), key)
    }

    /// Handshake by hand and return the agent-side multiplexer
    async fn connect_agent(
        state: &Arc<BrokerState>,
        key: &str,
        cancel: &CancellationToken,
        keepalive: Option<Duration>,
    ) -> (Multiplexer, tokio::task::JoinHandle<Result<(), TunnelError>>) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let handler = tokio::spawn(serve_connection(
            a,
            peer(),
            Arc::clone(state),
            cancel.clone(),
        ));

        let mut framed = Framed::new(b, FrameCodec::new());
        framed
            .send(Frame::Hello(Hello::new(key, ClientInfo::local("h", "0.1.0"))))
            .await
            .unwrap();
        match framed.next().await {
            Some(Ok(Frame::HelloAck(ack))) => assert!(ack.accepted),
            other => panic!("unexpected handshake reply: {:?}", other),
        }

        let mut config = MuxConfig::default();
        if let Some(interval) = keepalive {
            config = config.with_keepalive(interval);
        }
        (Multiplexer::from_framed(framed, Role::Client, config), handler)
    }

    async fn wait_registered(state: &BrokerState) -> Arc<Session> {
        for _ in 0..100 {
            if let Ok(session) = state.registry.lookup(&"u1".into()) {
                return session;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session never registered");
    }

    #[tokio::test]
    async fn test_agent_logout_closes_session() {
        let (state, key) = broker(BrokerConfig::default());
        let cancel = CancellationToken::new();
        let (agent, handler) = connect_agent(&state, &key, &cancel, None).await;

        let session = wait_registered(&state).await;
        agent.close();
        handler.await.unwrap().unwrap();

        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.drain_reason(), Some(DrainReason::Logout));
        assert!(state.registry.is_empty());
        assert_eq!(state.metrics.snapshot(0).sessions_closed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_silence_drains_session() {
        let config = BrokerConfig {
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_grace: Some(Duration::from_secs(10)),
            ..BrokerConfig::default()
        };
        let (state, key) = broker(config);
        let cancel = CancellationToken::new();
        let (agent, handler) = connect_agent(&state, &key, &cancel, None).await;
        let session = wait_registered(&state).await;

        handler.await.unwrap().unwrap();
        assert_eq!(session.drain_reason(), Some(DrainReason::HeartbeatTimeout));
        assert!(state.registry.lookup(&"u1".into()).is_err());

        let _ = agent.closed().await;
        assert_eq!(agent.remote_go_away(), Some(GoAwayCode::HeartbeatTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pinging_agent_stays_registered() {
        let config = BrokerConfig {
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_grace: Some(Duration::from_secs(10)),
            ..BrokerConfig::default()
        };
        let (state, key) = broker(config);
        let cancel = CancellationToken::new();
        let (_agent, handler) =
            connect_agent(&state, &key, &cancel, Some(Duration::from_secs(5))).await;
        let session = wait_registered(&state).await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(session.is_active());

        cancel.cancel();
        handler.await.unwrap().unwrap();
        assert_eq!(session.drain_reason(), Some(DrainReason::Shutdown));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_reconnect_replaces_previous_session() {
        let (state, key) = broker(BrokerConfig::default());
        let cancel = CancellationToken::new();

        let (first_agent, first_handler) = connect_agent(&state, &key, &cancel, None).await;
        let first = wait_registered(&state).await;

        let (_second_agent, _second_handler) = connect_agent(&state, &key, &cancel, None).await;
        first_handler.await.unwrap().unwrap();

        assert_eq!(first.state(), SessionState::Closed);
        assert_eq!(first.drain_reason(), Some(DrainReason::Replaced));
        let current = state.registry.lookup(&"u1".into()).unwrap();
        assert!(!Arc::ptr_eq(&current, &first));

        let _ = first_agent.closed().await;
        assert_eq!(first_agent.remote_go_away(), Some(GoAwayCode::Replaced));
        assert_eq!(state.metrics.snapshot(1).sessions_replaced, 1);
    }

    #[test]
    fn test_pre_admission_phases() {
        let mut phase = SessionState::Connecting;
        advance(peer(), &mut phase, SessionState::Authenticating);
        assert_eq!(phase, SessionState::Authenticating);
        advance(peer(), &mut phase, SessionState::Closed);
        assert_eq!(phase, SessionState::Closed);

        let mut phase = SessionState::Connecting;
        advance(peer(), &mut phase, SessionState::Closed);
        assert_eq!(phase, SessionState::Closed);
    }

    #[tokio::test]
    async fn test_admin_key_marks_session() {
        let (key, mut entry) = generate_api_key("u1");
        entry.admin = true;
        let auth = ApiKeyAuthenticator::from_entries([entry]);
        let state = Arc::new(BrokerState::new(BrokerConfig::default(), Arc::new(auth)));
        let cancel = CancellationToken::new();

        let (_agent, handler) = connect_agent(&state, &key, &cancel, None).await;
        let session = wait_registered(&state).await;
        assert!(session.is_admin());
        let summary: SessionSummary = session.summary();
        assert!(summary.is_admin);

        cancel.cancel();
        handler.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_rejected_agent_is_counted() {
        let (state, _key) = broker(BrokerConfig::default());
        let (a, b) = tokio::io::duplex(64 * 1024);
        let handler = tokio::spawn(serve_connection(
            a,
            peer(),
            Arc::clone(&state),
            CancellationToken::new(),
        ));

        let mut framed = Framed::new(b, FrameCodec::new());
        framed
            .send(Frame::Hello(Hello::new("ak_0.bad", ClientInfo::default())))
            .await
            .unwrap();

        let err = handler.await.unwrap().unwrap_err();
        assert!(matches!(err, TunnelError::AuthFailed(_)));
        let snapshot = state.metrics.snapshot(0);
        assert_eq!(snapshot.auth_failures, 1);
        assert_eq!(snapshot.handshake_failures, 1);
        assert!(state.registry.is_empty());
    }
}
