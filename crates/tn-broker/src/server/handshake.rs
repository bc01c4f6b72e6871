//! Hello/HelloAck exchange on a fresh agent connection
//!
//! Runs on the raw framed connection before the multiplexer starts. Every
//! rejection is answered with a `HelloAck` carrying the reason so the agent
//! can tell a bad key from a transient failure.

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_util::codec::Framed;

use tn_core::{ClientIdentity, TimeoutKind, TunnelError};
use tn_protocol::frame::FrameType;
use tn_protocol::{
    is_compatible_version, ClientInfo, Frame, FrameCodec, HelloAck, ProtocolError,
    PROTOCOL_VERSION, REJECT_AT_CAPACITY,
};

use crate::auth::AuthError;
use crate::state::BrokerState;

/// An agent that passed the handshake
#[derive(Debug, Clone)]
pub struct Admission {
    pub identity: ClientIdentity,
    pub client: ClientInfo,
    pub is_admin: bool,
}

/// Why an agent was not admitted
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("handshake timed out")]
    Timeout,

    #[error("peer disconnected during handshake")]
    Disconnected,

    #[error("expected Hello, got {0:?}")]
    UnexpectedFrame(FrameType),

    #[error("incompatible protocol version {0}")]
    IncompatibleVersion(String),

    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("account {0} is not verified")]
    Unverified(ClientIdentity),

    #[error("broker at capacity")]
    AtCapacity,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl HandshakeError {
    /// Reason sent back to the agent, if one is sent at all
    fn reason(&self) -> Option<String> {
        match self {
            HandshakeError::IncompatibleVersion(version) => Some(format!(
                "incompatible protocol version {} (broker speaks {})",
                version, PROTOCOL_VERSION
            )),
            HandshakeError::Auth(err) => Some(err.to_string()),
            HandshakeError::Unverified(_) => Some("account not verified".to_string()),
            HandshakeError::AtCapacity => Some(REJECT_AT_CAPACITY.to_string()),
            HandshakeError::UnexpectedFrame(frame_type) => {
                Some(format!("expected Hello, got {:?}", frame_type))
            }
            HandshakeError::Timeout
            | HandshakeError::Disconnected
            | HandshakeError::Protocol(_) => None,
        }
    }
}

impl From<HandshakeError> for TunnelError {
    fn from(err: HandshakeError) -> Self {
        match err {
            HandshakeError::Timeout => TunnelError::Timeout(TimeoutKind::Handshake),
            HandshakeError::Disconnected => {
                TunnelError::ConnectionLost("disconnected during handshake".into())
            }
            HandshakeError::Auth(err) => err.into(),
            HandshakeError::Unverified(identity) => {
                TunnelError::AuthFailed(format!("account {} is not verified", identity))
            }
            HandshakeError::Protocol(err) => err.into(),
            other => TunnelError::Protocol(other.to_string()),
        }
    }
}

/// Run the broker side of the handshake within the configured timeout
pub async fn handshake<T>(
    framed: &mut Framed<T, FrameCodec>,
    state: &BrokerState,
) -> Result<Admission, HandshakeError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    match timeout(state.config.handshake_timeout, exchange(framed, state)).await {
        Ok(result) => result,
        Err(_) => Err(HandshakeError::Timeout),
    }
}

async fn exchange<T>(
    framed: &mut Framed<T, FrameCodec>,
    state: &BrokerState,
) -> Result<Admission, HandshakeError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let hello = match framed.next().await {
        Some(Ok(Frame::Hello(hello))) => hello,
        Some(Ok(other)) => {
            let err = HandshakeError::UnexpectedFrame(other.frame_type());
            reject(framed, &err).await;
            return Err(err);
        }
        Some(Err(err)) => return Err(err.into()),
        None => return Err(HandshakeError::Disconnected),
    };

    tracing::debug!(
        "Hello from {} (agent {}, protocol {})",
        hello.client.hostname,
        hello.client.agent_version,
        hello.version
    );

    let admission = match admit(&hello.version, &hello.credential, state).await {
        Ok((identity, is_admin)) => Admission {
            identity,
            client: hello.client,
            is_admin,
        },
        Err(err) => {
            reject(framed, &err).await;
            return Err(err);
        }
    };

    let ack = HelloAck {
        accepted: true,
        identity: Some(admission.identity.to_string()),
        reason: None,
        heartbeat_interval_ms: state.config.heartbeat_interval.as_millis() as u64,
        window_size: state.config.stream_window,
        max_streams: state.config.max_streams_per_session,
    };
    framed.send(Frame::HelloAck(ack)).await?;

    Ok(admission)
}

async fn admit(
    version: &str,
    credential: &str,
    state: &BrokerState,
) -> Result<(ClientIdentity, bool), HandshakeError> {
    if !is_compatible_version(version) {
        return Err(HandshakeError::IncompatibleVersion(version.to_string()));
    }

    let outcome = state.authenticator.authenticate(credential).await?;
    if !outcome.verified {
        return Err(HandshakeError::Unverified(outcome.identity));
    }

    // A reconnect replaces an existing session, so it never adds load
    if let Some(max) = state.config.max_sessions {
        if state.registry.len() >= max && !state.registry.contains(&outcome.identity) {
            return Err(HandshakeError::AtCapacity);
        }
    }

    Ok((outcome.identity, outcome.is_admin))
}

async fn reject<T>(framed: &mut Framed<T, FrameCodec>, err: &HandshakeError)
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let Some(reason) = err.reason() else {
        return;
    };
    if let Err(e) = framed.send(Frame::HelloAck(HelloAck::rejected(reason))).await {
        tracing::debug!("Failed to send handshake rejection: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use tn_core::config::BrokerConfig;
    use tn_protocol::Hello;

    use crate::auth::{generate_api_key, ApiKeyAuthenticator};

    fn state_with_key(identity: &str, config: BrokerConfig) -> (BrokerState, String) {
        let (key, entry) = generate_api_key(identity);
        let auth = ApiKeyAuthenticator::from_entries([entry]);
        (BrokerState::new(config, Arc::new(auth)), key)
    }

    async fn run(
        state: &BrokerState,
        hello: Frame,
    ) -> (Result<Admission, HandshakeError>, Option<HelloAck>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut server = Framed::new(a, FrameCodec::new());
        let mut agent = Framed::new(b, FrameCodec::new());

        agent.send(hello).await.unwrap();
        let result = handshake(&mut server, state).await;
        drop(server);

        let ack = match agent.next().await {
            Some(Ok(Frame::HelloAck(ack))) => Some(ack),
            _ => None,
        };
        (result, ack)
    }

    fn hello(key: &str) -> Frame {
        Frame::Hello(Hello::new(key, ClientInfo::local("agent-host", "0.1.0")))
    }

    #[tokio::test]
    async fn test_valid_key_is_admitted() {
        let (state, key) = state_with_key("u1", BrokerConfig::default());

        let (result, ack) = run(&state, hello(&key)).await;
        let admission = result.unwrap();
        assert_eq!(admission.identity.as_str(), "u1");
        assert_eq!(admission.client.hostname, "agent-host");

        let ack = ack.unwrap();
        assert!(ack.accepted);
        assert_eq!(ack.identity.as_deref(), Some("u1"));
        assert_eq!(ack.heartbeat_interval_ms, 15_000);
        assert_eq!(ack.window_size, 256 * 1024);
    }

    #[tokio::test]
    async fn test_bad_key_is_rejected_with_reason() {
        let (state, _key) = state_with_key("u1", BrokerConfig::default());

        let (result, ack) = run(&state, hello("ak_00000000.wrong")).await;
        assert!(matches!(result, Err(HandshakeError::Auth(AuthError::InvalidCredential))));
        let ack = ack.unwrap();
        assert!(!ack.accepted);
        assert_eq!(ack.reason.as_deref(), Some("invalid credential"));
    }

    #[tokio::test]
    async fn test_incompatible_version_is_rejected() {
        let (state, key) = state_with_key("u1", BrokerConfig::default());
        let mut hello = Hello::new(key, ClientInfo::default());
        hello.version = "2.0".into();

        let (result, ack) = run(&state, Frame::Hello(hello)).await;
        assert!(matches!(result, Err(HandshakeError::IncompatibleVersion(_))));
        assert!(ack.unwrap().reason.unwrap().contains("2.0"));
    }

    #[tokio::test]
    async fn test_unverified_account_is_rejected() {
        let (key, mut entry) = generate_api_key("u1");
        entry.verified = false;
        let state = BrokerState::new(
            BrokerConfig::default(),
            Arc::new(ApiKeyAuthenticator::from_entries([entry])),
        );

        let (result, ack) = run(&state, hello(&key)).await;
        assert!(matches!(result, Err(HandshakeError::Unverified(_))));
        assert!(!ack.unwrap().accepted);
    }

    #[tokio::test]
    async fn test_non_hello_first_frame_is_rejected() {
        let (state, _key) = state_with_key("u1", BrokerConfig::default());

        let (result, ack) = run(&state, Frame::Ping { nonce: 1 }).await;
        assert!(matches!(
            result,
            Err(HandshakeError::UnexpectedFrame(FrameType::Ping))
        ));
        assert!(!ack.unwrap().accepted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let config = BrokerConfig {
            handshake_timeout: Duration::from_secs(2),
            ..BrokerConfig::default()
        };
        let (state, _key) = state_with_key("u1", config);
        let (a, _b) = tokio::io::duplex(1024);
        let mut server = Framed::new(a, FrameCodec::new());

        let err = handshake(&mut server, &state).await.unwrap_err();
        assert!(matches!(err, HandshakeError::Timeout));
        assert!(matches!(
            TunnelError::from(err),
            TunnelError::Timeout(TimeoutKind::Handshake)
        ));
    }

    #[tokio::test]
    async fn test_capacity_admits_known_identity_only() {
        let (key_u1, entry_u1) = generate_api_key("u1");
        let (key_u2, entry_u2) = generate_api_key("u2");
        let config = BrokerConfig {
            max_sessions: Some(1),
            ..BrokerConfig::default()
        };
        let state = BrokerState::new(
            config,
            Arc::new(ApiKeyAuthenticator::from_entries([entry_u1, entry_u2])),
        );

        let (session, _agent) = crate::session::test_support::session_pair(1, "u1");
        state.registry.register(session).unwrap();

        let (result, _) = run(&state, hello(&key_u2)).await;
        assert!(matches!(result, Err(HandshakeError::AtCapacity)));

        let (result, _) = run(&state, hello(&key_u1)).await;
        assert_eq!(result.unwrap().identity.as_str(), "u1");
    }
}
