//! Agent listener
//!
//! Accepts incoming agent connections and spawns a handler for each.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::server::handler::serve_connection;
use crate::session::DrainReason;
use crate::state::BrokerState;

/// How long shutdown waits for handlers to finish draining
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Server that accepts agent connections
pub struct BrokerServer {
    /// Shared broker state
    state: Arc<BrokerState>,
    /// Cancellation token for graceful shutdown
    cancel: CancellationToken,
}

impl BrokerServer {
    pub fn new(state: Arc<BrokerState>, cancel: CancellationToken) -> Self {
        Self { state, cancel }
    }

    /// Bind and run until cancelled
    pub async fn run(&self, bind_addr: &str) -> Result<()> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", bind_addr))?;
        self.run_on(listener).await
    }

    /// Run on an already bound listener until cancelled
    pub async fn run_on(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!("Broker listening for agents on {}", local_addr);

        let mut handlers = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("Broker listener shutting down");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((socket, peer_addr)) => {
                            self.handle_connection(&mut handlers, socket, peer_addr);
                        }
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {}", e);
                        }
                    }
                }

                // Reap finished handlers so the set does not grow unbounded
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!("Connection handler panicked: {}", e);
                    }
                }
            }
        }

        drop(listener);
        self.state.registry.close_all(DrainReason::Shutdown);

        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while handlers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!("Aborting {} connection handlers", handlers.len());
            handlers.shutdown().await;
        }

        Ok(())
    }

    fn handle_connection(
        &self,
        handlers: &mut JoinSet<()>,
        socket: TcpStream,
        peer_addr: SocketAddr,
    ) {
        tracing::debug!("New agent connection from {}", peer_addr);
        if let Err(e) = socket.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
        }

        let state = Arc::clone(&self.state);
        let cancel = self.cancel.clone();
        handlers.spawn(async move {
            match serve_connection(socket, peer_addr, state, cancel).await {
                Ok(()) => tracing::debug!("Connection from {} finished", peer_addr),
                Err(e) => tracing::debug!("Connection from {} ended: {}", peer_addr, e),
            }
        });
    }
}
