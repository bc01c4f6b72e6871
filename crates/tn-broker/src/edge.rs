//! Public TCP edge
//!
//! Each configured binding accepts plain TCP callers on a public address
//! and routes every connection to one identity's agent.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use tn_core::config::EdgeBinding;
use tn_core::ClientIdentity;

use crate::router::{RouteError, StreamRouter};

/// Accept loop for one edge binding
pub struct EdgeListener {
    identity: ClientIdentity,
    listener: TcpListener,
    router: Arc<StreamRouter>,
    cancel: CancellationToken,
}

impl EdgeListener {
    /// Bind the public address of `binding`
    pub async fn bind(
        binding: &EdgeBinding,
        router: Arc<StreamRouter>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(&binding.listen)
            .await
            .with_context(|| format!("Failed to bind edge listener {}", binding.listen))?;
        Ok(Self::from_listener(
            listener,
            ClientIdentity::new(binding.identity.clone()),
            router,
            cancel,
        ))
    }

    pub fn from_listener(
        listener: TcpListener,
        identity: ClientIdentity,
        router: Arc<StreamRouter>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            identity,
            listener,
            router,
            cancel,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept callers until cancelled
    pub async fn run(self) -> Result<()> {
        tracing::info!(
            "Edge listener on {} routes to {}",
            self.local_addr()?,
            self.identity
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::debug!("Edge listener for {} shutting down", self.identity);
                    return Ok(());
                }
                result = self.listener.accept() => match result {
                    Ok((socket, caller_addr)) => self.spawn_route(socket, caller_addr),
                    Err(e) => tracing::error!("Edge accept failed: {}", e),
                }
            }
        }
    }

    fn spawn_route(&self, socket: TcpStream, caller_addr: SocketAddr) {
        let router = Arc::clone(&self.router);
        let identity = self.identity.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let _ = socket.set_nodelay(true);
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = router.route(&identity, socket) => result,
            };
            match result {
                Ok(stats) => tracing::debug!(
                    "Caller {} -> {} done ({} up, {} down)",
                    caller_addr,
                    identity,
                    stats.to_agent,
                    stats.to_caller
                ),
                Err(RouteError::Rejected(e)) => {
                    tracing::warn!("Caller {} -> {} rejected: {}", caller_addr, identity, e)
                }
                Err(e) => tracing::info!("Caller {} -> {}: {}", caller_addr, identity, e),
            }
        });
    }
}
