//! tn-agent: Tunnel agent
//!
//! The agent runs next to a private service, dials the broker once and
//! keeps the multiplexed session alive. Every stream the broker opens is
//! forwarded to the local service. Lost connections are re-established
//! with exponential backoff; rejected credentials and replacement by a
//! newer agent for the same identity stop the agent.

pub mod forward;
pub mod tunnel;

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use tn_core::config::AgentConfig;
use tn_protocol::GoAwayCode;

pub use forward::LocalForwarder;
pub use tunnel::{ActiveTunnel, ConnectionError, ExponentialBackoff, TunnelConnector};

/// Reasons the agent stops for good
#[derive(Debug, Error)]
pub enum AgentError {
    /// The broker refused the agent in a way retrying cannot fix
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Another agent registered the same identity
    #[error("Replaced by a newer session for the same identity")]
    Replaced,
}

/// How one session ended
#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionEnd {
    Cancelled,
    Replaced,
    Lost(String),
}

/// The agent main loop
pub struct Agent {
    connector: TunnelConnector,
    forwarder: Arc<LocalForwarder>,
    cancel: CancellationToken,
}

impl Agent {
    pub fn new(config: AgentConfig, cancel: CancellationToken) -> Self {
        let forwarder = Arc::new(LocalForwarder::new(
            config.local_address.clone(),
            config.local_connect_timeout,
        ));
        Self {
            connector: TunnelConnector::new(config),
            forwarder,
            cancel,
        }
    }

    /// Connect, serve, reconnect; returns once cancelled or stopped for good
    pub async fn run(&self) -> Result<(), AgentError> {
        let config = self.connector.config();
        let mut backoff = ExponentialBackoff::from_config(&config.backoff);

        loop {
            let connected = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                result = self.connector.connect() => result,
            };

            match connected {
                Ok(tunnel) => {
                    backoff.reset();
                    match self.serve(tunnel).await {
                        SessionEnd::Cancelled => return Ok(()),
                        SessionEnd::Replaced => {
                            tracing::warn!("Another agent took over this identity, stopping");
                            return Err(AgentError::Replaced);
                        }
                        SessionEnd::Lost(reason) => {
                            tracing::warn!("Tunnel to {} lost: {}", config.broker_address, reason);
                        }
                    }
                }
                Err(e) if !e.is_retryable() => {
                    tracing::error!("{}", e);
                    return Err(e.into());
                }
                Err(e) => tracing::warn!("Connection failed: {}", e),
            }

            let delay = backoff.next_delay();
            tracing::info!("Reconnecting in {:?}", delay);
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Forward broker-opened streams until the session ends
    async fn serve(&self, tunnel: ActiveTunnel) -> SessionEnd {
        let mux = tunnel.mux;
        tracing::info!(
            "Serving {} for {} (heartbeat every {:?})",
            self.forwarder.address(),
            tunnel.identity,
            tunnel.heartbeat_interval
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    mux.close();
                    return SessionEnd::Cancelled;
                }
                accepted = mux.accept() => match accepted {
                    Ok(stream) => {
                        let forwarder = Arc::clone(&self.forwarder);
                        tokio::spawn(async move {
                            let _ = forwarder.forward(stream).await;
                        });
                    }
                    Err(err) => {
                        return match mux.remote_go_away() {
                            Some(GoAwayCode::Replaced) => SessionEnd::Replaced,
                            Some(code) => SessionEnd::Lost(format!("broker closed the session: {}", code)),
                            None => SessionEnd::Lost(err.to_string()),
                        };
                    }
                },
            }
        }
    }
}
