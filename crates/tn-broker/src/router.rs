//! Stream router
//!
//! Bridges an external caller connection to a fresh stream on the agent
//! session registered for an identity. Only the stream is ever closed
//! here; the session is left alone whatever happens to a route.

use std::future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::time::timeout;

use tn_core::config::BrokerConfig;
use tn_core::{ClientIdentity, TimeoutKind, TunnelError};
use tn_protocol::Stream;

use crate::metrics::BrokerMetrics;
use crate::registry::SessionRegistry;

const COPY_BUF_SIZE: usize = 16 * 1024;

/// Bytes moved by one route
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransferStats {
    /// Caller -> agent
    pub to_agent: u64,
    /// Agent -> caller
    pub to_caller: u64,
}

/// Why a route failed
#[derive(Error, Debug)]
pub enum RouteError {
    /// Nothing was transferred; safe to retry
    #[error("route rejected: {0}")]
    Rejected(#[source] TunnelError),

    /// The transfer started and broke off
    #[error(
        "route interrupted after {} bytes to agent and {} to caller: {source}",
        stats.to_agent,
        stats.to_caller
    )]
    Interrupted {
        stats: TransferStats,
        #[source]
        source: TunnelError,
    },
}

impl RouteError {
    /// The underlying error
    pub fn tunnel_error(&self) -> &TunnelError {
        match self {
            RouteError::Rejected(err) => err,
            RouteError::Interrupted { source, .. } => source,
        }
    }

    /// Bytes moved before the failure
    pub fn stats(&self) -> TransferStats {
        match self {
            RouteError::Rejected(_) => TransferStats::default(),
            RouteError::Interrupted { stats, .. } => *stats,
        }
    }
}

/// Route timeouts
#[derive(Debug, Clone, Copy)]
pub struct RouterConfig {
    /// Time for the agent to acknowledge the stream
    pub dial_timeout: Duration,
    /// Close the route after this long without traffic
    pub idle_timeout: Duration,
    /// Optional cap on the total route duration
    pub max_lifetime: Option<Duration>,
}

impl From<&BrokerConfig> for RouterConfig {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            dial_timeout: config.dial_timeout,
            idle_timeout: config.idle_timeout,
            max_lifetime: config.max_stream_lifetime,
        }
    }
}

/// Connects callers to agents
pub struct StreamRouter {
    registry: Arc<SessionRegistry>,
    metrics: Arc<BrokerMetrics>,
    config: RouterConfig,
}

impl StreamRouter {
    pub fn new(
        registry: Arc<SessionRegistry>,
        metrics: Arc<BrokerMetrics>,
        config: RouterConfig,
    ) -> Self {
        Self {
            registry,
            metrics,
            config,
        }
    }

    /// Open a stream on `identity`'s session and copy bytes both ways until
    /// both sides finish, either side fails, or a timeout fires.
    pub async fn route<C>(
        &self,
        identity: &ClientIdentity,
        caller: C,
    ) -> Result<TransferStats, RouteError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let stream = match self.dial(identity).await {
            Ok(stream) => stream,
            Err(err) => {
                self.metrics.route_rejected();
                tracing::debug!("Route to {} rejected: {}", identity, err);
                return Err(RouteError::Rejected(err));
            }
        };

        self.metrics.route_opened();
        let stream_id = stream.id();
        tracing::debug!("Routing caller to {} on {}", identity, stream_id);

        let result = pump(caller, stream, self.config.idle_timeout, self.config.max_lifetime).await;
        let (stats, completed) = match &result {
            Ok(stats) => (*stats, true),
            Err(err) => (err.stats(), false),
        };
        self.metrics
            .route_finished(stats.to_agent, stats.to_caller, completed);

        tracing::debug!(
            "Route to {} on {} finished: {} bytes in, {} bytes out",
            identity,
            stream_id,
            stats.to_agent,
            stats.to_caller
        );
        result
    }

    async fn dial(&self, identity: &ClientIdentity) -> Result<Stream, TunnelError> {
        let session = self.registry.lookup(identity)?;
        match timeout(self.config.dial_timeout, session.open_stream()).await {
            Ok(result) => result,
            Err(_) => Err(TunnelError::Timeout(TimeoutKind::Dial)),
        }
    }
}

/// Copy in both directions, half-closing each side on EOF
async fn pump<C>(
    caller: C,
    stream: Stream,
    idle_timeout: Duration,
    max_lifetime: Option<Duration>,
) -> Result<TransferStats, RouteError>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let (mut caller_rd, mut caller_wr) = tokio::io::split(caller);
    let (mut agent_rd, mut agent_wr) = tokio::io::split(stream);
    let to_agent = AtomicU64::new(0);
    let to_caller = AtomicU64::new(0);
    let activity = Notify::new();

    let transfer = async {
        tokio::try_join!(
            copy_half(&mut caller_rd, &mut agent_wr, &to_agent, &activity),
            copy_half(&mut agent_rd, &mut caller_wr, &to_caller, &activity),
        )
    };
    let idle = async {
        while timeout(idle_timeout, activity.notified()).await.is_ok() {}
    };
    let lifetime = async {
        match max_lifetime {
            Some(limit) => tokio::time::sleep(limit).await,
            None => future::pending::<()>().await,
        }
    };

    let outcome = tokio::select! {
        result = transfer => result.map(|_| ()).map_err(TunnelError::from_io),
        _ = idle => Err(TunnelError::Timeout(TimeoutKind::Idle)),
        _ = lifetime => Err(TunnelError::Timeout(TimeoutKind::Lifetime)),
    };

    let stats = TransferStats {
        to_agent: to_agent.load(Ordering::Relaxed),
        to_caller: to_caller.load(Ordering::Relaxed),
    };
    match outcome {
        Ok(()) => Ok(stats),
        Err(source) => Err(RouteError::Interrupted { stats, source }),
    }
}

async fn copy_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    counter: &AtomicU64,
    activity: &Notify,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            writer.shutdown().await?;
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
        activity.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support::{session_pair, session_pair_with};
    use tn_protocol::MuxConfig;
    use tokio::io::duplex;

    fn router(registry: Arc<SessionRegistry>, config: RouterConfig) -> StreamRouter {
        StreamRouter::new(registry, Arc::new(BrokerMetrics::new()), config)
    }

    fn quick_config() -> RouterConfig {
        RouterConfig {
            dial_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
            max_lifetime: None,
        }
    }

    #[tokio::test]
    async fn test_unknown_identity_is_rejected() {
        let registry = Arc::new(SessionRegistry::new());
        let router = router(Arc::clone(&registry), quick_config());
        let (caller, _far) = duplex(1024);

        let err = router
            .route(&ClientIdentity::new("unknown-id"), caller)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RouteError::Rejected(TunnelError::NoActiveTunnel(_))
        ));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_route_echo_round_trip() {
        let registry = Arc::new(SessionRegistry::new());
        let (session, agent) = session_pair(1, "u1");
        registry.register(Arc::clone(&session)).unwrap();

        tokio::spawn(async move {
            let stream = agent.accept().await.unwrap();
            let (mut rd, mut wr) = tokio::io::split(stream);
            tokio::io::copy(&mut rd, &mut wr).await.unwrap();
            wr.shutdown().await.unwrap();
            // Keep the agent side alive until the route is done
            let _ = agent.closed().await;
        });

        let router = router(Arc::clone(&registry), quick_config());
        let (caller, mut far) = duplex(1024);
        let route = tokio::spawn(async move {
            router.route(&ClientIdentity::new("u1"), caller).await
        });

        far.write_all(b"PING").await.unwrap();
        far.shutdown().await.unwrap();
        let mut reply = Vec::new();
        far.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"PING");

        let stats = route.await.unwrap().unwrap();
        assert_eq!(stats, TransferStats { to_agent: 4, to_caller: 4 });
        assert!(session.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_route_times_out_without_closing_session() {
        let registry = Arc::new(SessionRegistry::new());
        let (session, agent) = session_pair(1, "u1");
        registry.register(Arc::clone(&session)).unwrap();

        // Agent accepts but never answers
        let holder = tokio::spawn(async move {
            let stream = agent.accept().await.unwrap();
            let _ = agent.closed().await;
            drop(stream);
        });

        let config = RouterConfig {
            idle_timeout: Duration::from_secs(3),
            ..quick_config()
        };
        let router = router(Arc::clone(&registry), config);
        let (caller, _far) = duplex(1024);

        let err = router
            .route(&ClientIdentity::new("u1"), caller)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RouteError::Interrupted {
                source: TunnelError::Timeout(TimeoutKind::Idle),
                ..
            }
        ));
        assert!(session.is_active());
        assert!(registry.lookup(session.identity()).is_ok());

        session.drain(crate::session::DrainReason::Shutdown);
        holder.await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_stream_is_rejected() {
        let registry = Arc::new(SessionRegistry::new());
        let refusing = MuxConfig {
            max_streams: 0,
            ..MuxConfig::default()
        };
        let (session, _agent) = session_pair_with(1, "u1", refusing);
        registry.register(Arc::clone(&session)).unwrap();

        let router = router(Arc::clone(&registry), quick_config());
        let (caller, _far) = duplex(1024);
        let err = router
            .route(&ClientIdentity::new("u1"), caller)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RouteError::Rejected(TunnelError::StreamLimitExceeded)
        ));
        assert_eq!(err.stats(), TransferStats::default());
        // A refused stream leaves the session alone
        assert!(session.is_active());
        assert!(registry.lookup(session.identity()).is_ok());
    }

    #[tokio::test]
    async fn test_route_counted_once_stream_opens() {
        let registry = Arc::new(SessionRegistry::new());
        let (session, agent) = session_pair(1, "u1");
        registry.register(Arc::clone(&session)).unwrap();

        let router = Arc::new(router(Arc::clone(&registry), quick_config()));
        let (caller, far) = duplex(1024);
        let route = tokio::spawn({
            let router = Arc::clone(&router);
            async move { router.route(&ClientIdentity::new("u1"), caller).await }
        });

        // The stream is up but nothing has flowed yet
        let stream = agent.accept().await.unwrap();
        let mut counted = false;
        for _ in 0..100 {
            if router.metrics.snapshot(1).streams_routed == 1 {
                counted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(counted);
        assert!(!route.is_finished());

        drop(far);
        drop(stream);
        let _ = route.await.unwrap();
        assert_eq!(router.metrics.snapshot(1).streams_routed, 1);
    }

    #[tokio::test]
    async fn test_closed_connection_is_not_routed() {
        let registry = Arc::new(SessionRegistry::new());
        let (session, agent) = session_pair(1, "u1");
        registry.register(Arc::clone(&session)).unwrap();

        // The agent goes away before its handler drains the session
        agent.close();
        let _ = session.mux().closed().await;

        let router = router(Arc::clone(&registry), quick_config());
        let (caller, _far) = duplex(1024);
        let err = router
            .route(&ClientIdentity::new("u1"), caller)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RouteError::Rejected(TunnelError::NoActiveTunnel(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_routes_share_one_session() {
        let registry = Arc::new(SessionRegistry::new());
        let (session, agent) = session_pair(1, "u1");
        registry.register(Arc::clone(&session)).unwrap();

        // Agent answers every stream with PONG plus the request
        tokio::spawn(async move {
            while let Ok(stream) = agent.accept().await {
                tokio::spawn(async move {
                    let (mut rd, mut wr) = tokio::io::split(stream);
                    let mut request = Vec::new();
                    rd.read_to_end(&mut request).await.unwrap();
                    wr.write_all(b"PONG ").await.unwrap();
                    wr.write_all(&request).await.unwrap();
                    wr.shutdown().await.unwrap();
                });
            }
        });

        let router = Arc::new(router(Arc::clone(&registry), quick_config()));
        let mut calls = Vec::new();
        for i in 0..8 {
            let router = Arc::clone(&router);
            calls.push(tokio::spawn(async move {
                let (caller, mut far) = duplex(1024);
                let route = tokio::spawn(async move {
                    router.route(&ClientIdentity::new("u1"), caller).await
                });

                let request = format!("PING {}", i);
                far.write_all(request.as_bytes()).await.unwrap();
                far.shutdown().await.unwrap();
                let mut reply = String::new();
                far.read_to_string(&mut reply).await.unwrap();
                assert_eq!(reply, format!("PONG {}", request));
                route.await.unwrap().unwrap()
            }));
        }

        for call in calls {
            let stats = call.await.unwrap();
            assert_eq!(stats.to_caller, stats.to_agent + 5);
        }
        assert_eq!(session.mux().stats().streams_opened, 8);
        assert!(session.is_active());
    }
}
