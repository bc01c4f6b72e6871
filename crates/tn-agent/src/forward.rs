//! Local service forwarding
//!
//! Every stream the broker opens is bridged to a fresh TCP connection to
//! the local service.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

use tn_core::{TimeoutKind, TunnelError};
use tn_protocol::Stream;

/// Bridges broker streams to the local service
#[derive(Debug, Clone)]
pub struct LocalForwarder {
    address: String,
    connect_timeout: Duration,
}

impl LocalForwarder {
    pub fn new(address: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            connect_timeout,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Copy between `stream` and a new local connection until both sides
    /// finish. Returns `(to_local, from_local)` byte counts.
    ///
    /// If the local service is unreachable the stream is reset so the
    /// caller sees the failure at once.
    pub async fn forward(&self, mut stream: Stream) -> Result<(u64, u64), TunnelError> {
        let mut local = match self.connect().await {
            Ok(local) => local,
            Err(err) => {
                tracing::warn!("Local service {} unreachable: {}", self.address, err);
                stream.reset();
                return Err(err);
            }
        };

        let stream_id = stream.id();
        tracing::debug!("Forwarding {} to {}", stream_id, self.address);

        let counts = tokio::io::copy_bidirectional(&mut stream, &mut local)
            .await
            .map_err(TunnelError::from_io)?;
        tracing::debug!(
            "{} finished: {} bytes to local, {} bytes back",
            stream_id,
            counts.0,
            counts.1
        );
        Ok(counts)
    }

    async fn connect(&self) -> Result<TcpStream, TunnelError> {
        let local = timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| TunnelError::Timeout(TimeoutKind::Dial))??;
        let _ = local.set_nodelay(true);
        Ok(local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tn_protocol::{MuxConfig, Multiplexer, ResetCode, Role};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn mux_pair() -> (Multiplexer, Multiplexer) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        (
            Multiplexer::new(a, Role::Server, MuxConfig::default()),
            Multiplexer::new(b, Role::Client, MuxConfig::default()),
        )
    }

    #[tokio::test]
    async fn test_forward_to_local_echo() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let (mut rd, mut wr) = socket.split();
            tokio::io::copy(&mut rd, &mut wr).await.unwrap();
            wr.shutdown().await.unwrap();
        });

        let (broker, agent) = mux_pair();
        let forwarder = LocalForwarder::new(addr, Duration::from_secs(5));
        let forwarding = tokio::spawn(async move {
            let stream = agent.accept().await.unwrap();
            let result = forwarder.forward(stream).await;
            (result, agent)
        });

        let mut stream = broker.open().await.unwrap();
        stream.write_all(b"PING").await.unwrap();
        stream.shutdown().await.unwrap();
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"PING");

        let (result, _agent) = forwarding.await.unwrap();
        assert_eq!(result.unwrap(), (4, 4));
    }

    #[tokio::test]
    async fn test_unreachable_local_service_resets_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let (broker, agent) = mux_pair();
        let forwarder = LocalForwarder::new(addr, Duration::from_secs(5));
        let forwarding = tokio::spawn(async move {
            let stream = agent.accept().await.unwrap();
            let result = forwarder.forward(stream).await;
            (result, agent)
        });

        let mut stream = broker.open().await.unwrap();
        let err = stream.read(&mut [0u8; 8]).await.unwrap_err();
        assert!(matches!(
            TunnelError::from_io(err),
            TunnelError::StreamReset(ResetCode::Cancel)
        ));

        let (result, _agent) = forwarding.await.unwrap();
        assert!(result.is_err());
    }
}
