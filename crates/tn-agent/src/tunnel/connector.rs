//! Outbound tunnel connector
//!
//! Dials the broker, runs the agent side of the handshake and starts the
//! client-role multiplexer with the parameters the broker advertised.

use std::io;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use tn_core::config::AgentConfig;
use tn_core::{ClientIdentity, TimeoutKind};
use tn_protocol::frame::FrameType;
use tn_protocol::{
    ClientInfo, Frame, FrameCodec, Hello, HelloAck, MuxConfig, Multiplexer, ProtocolError, Role,
};

/// Connection errors that may require special handling
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The broker refused the handshake
    #[error("Broker rejected the agent: {reason}")]
    Rejected { reason: String, transient: bool },

    /// TCP connect failed
    #[error("Failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    /// Connect or handshake deadline expired
    #[error("{0} timeout")]
    Timeout(TimeoutKind),

    /// The broker hung up before answering
    #[error("Broker closed the connection during handshake")]
    Closed,

    /// The broker answered with something other than `HelloAck`
    #[error("Unexpected {0:?} frame during handshake")]
    UnexpectedFrame(FrameType),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl ConnectionError {
    /// Whether reconnecting later can succeed without operator action
    pub fn is_retryable(&self) -> bool {
        match self {
            ConnectionError::Rejected { transient, .. } => *transient,
            _ => true,
        }
    }
}

/// An established, multiplexed session with the broker
pub struct ActiveTunnel {
    /// Identity the broker registered us under
    pub identity: ClientIdentity,
    /// Client-role multiplexer; the broker opens streams on it
    pub mux: Multiplexer,
    /// Ping interval the broker asked for
    pub heartbeat_interval: Duration,
}

/// Establishes the outbound tunnel to the broker
pub struct TunnelConnector {
    /// Agent configuration
    config: AgentConfig,
}

impl TunnelConnector {
    /// Create a new tunnel connector
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    /// Get the agent configuration
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Attempt a single connection to the broker
    pub async fn connect(&self) -> Result<ActiveTunnel, ConnectionError> {
        let address = &self.config.broker_address;
        tracing::debug!("Connecting to {}", address);

        let socket = timeout(self.config.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| ConnectionError::Timeout(TimeoutKind::Dial))?
            .map_err(|source| ConnectionError::Connect {
                address: address.clone(),
                source,
            })?;
        if let Err(e) = socket.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY: {}", e);
        }

        let mut framed = Framed::new(socket, FrameCodec::new());
        let ack = timeout(self.config.handshake_timeout, self.hello(&mut framed))
            .await
            .map_err(|_| ConnectionError::Timeout(TimeoutKind::Handshake))??;

        if !ack.accepted {
            let transient = ack.is_transient_rejection();
            return Err(ConnectionError::Rejected {
                reason: ack.reason.unwrap_or_else(|| "no reason given".to_string()),
                transient,
            });
        }

        let heartbeat_interval = Duration::from_millis(ack.heartbeat_interval_ms);
        let mut mux_config = MuxConfig {
            initial_window: ack.window_size,
            max_streams: ack.max_streams as usize,
            ..MuxConfig::default()
        };
        if !heartbeat_interval.is_zero() {
            mux_config = mux_config.with_keepalive(heartbeat_interval);
        }

        let identity = ClientIdentity::new(ack.identity.unwrap_or_default());
        tracing::info!("Connected to {} as {}", address, identity);

        Ok(ActiveTunnel {
            identity,
            mux: Multiplexer::from_framed(framed, Role::Client, mux_config),
            heartbeat_interval,
        })
    }

    async fn hello(
        &self,
        framed: &mut Framed<TcpStream, FrameCodec>,
    ) -> Result<HelloAck, ConnectionError> {
        let client = ClientInfo::local(self.config.hostname(), env!("CARGO_PKG_VERSION"));
        framed
            .send(Frame::Hello(Hello::new(self.config.api_key.clone(), client)))
            .await?;

        match framed.next().await {
            Some(Ok(Frame::HelloAck(ack))) => Ok(ack),
            Some(Ok(other)) => Err(ConnectionError::UnexpectedFrame(other.frame_type())),
            Some(Err(e)) => Err(e.into()),
            None => Err(ConnectionError::Closed),
        }
    }
}
