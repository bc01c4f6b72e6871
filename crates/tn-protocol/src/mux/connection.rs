//! Multiplexer over a single physical connection
//!
//! One reader task dispatches inbound frames to streams, one writer task
//! serializes every outbound frame, and an optional keepalive task pings
//! the peer. All three stop when the multiplexer shuts down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{Sink, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::codec::{Frame, FrameCodec};
use crate::error::ProtocolError;
use crate::message::{GoAwayCode, ResetCode};
use crate::stream_id::StreamId;

use super::config::{MuxConfig, Role};
use super::error::MuxError;
use super::lock;
use super::stream::{OpenResult, Stream, StreamShared};

/// Counters for one multiplexer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MuxStats {
    /// Payload bytes received on all streams
    pub bytes_in: u64,
    /// Payload bytes sent on all streams
    pub bytes_out: u64,
    /// Streams opened locally
    pub streams_opened: u64,
    /// Streams accepted from the peer
    pub streams_accepted: u64,
    /// Streams currently in the table
    pub open_streams: usize,
}

#[derive(Default)]
struct Counters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    streams_opened: AtomicU64,
    streams_accepted: AtomicU64,
}

struct StreamTable {
    streams: HashMap<StreamId, Arc<StreamShared>>,
    closed: bool,
}

/// A frame waiting for the writer task
struct Outbound {
    frame: Frame,
    /// Generated by the reader in answer to a peer frame
    reply: bool,
}

/// Why the reader stopped dispatching
enum Halt {
    GoAway(GoAwayCode),
    Violation(String),
}

/// State shared by the multiplexer handle, its streams and its tasks
pub(crate) struct MuxShared {
    role: Role,
    pub(crate) config: MuxConfig,
    table: Mutex<StreamTable>,
    next_id: AtomicU32,
    frame_tx: mpsc::UnboundedSender<Outbound>,
    /// Replies queued but not yet handed to the sink
    pending_replies: AtomicUsize,
    replies_drained: Notify,
    pings: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    cancel: CancellationToken,
    close_reason: Mutex<Option<MuxError>>,
    remote_go_away: Mutex<Option<GoAwayCode>>,
    epoch: Instant,
    last_ping_ms: AtomicU64,
    heard_ping: AtomicBool,
    counters: Counters,
}

impl MuxShared {
    /// Queue a frame for the writer task
    pub(crate) fn send_frame(&self, frame: Frame) -> Result<(), MuxError> {
        self.frame_tx
            .send(Outbound {
                frame,
                reply: false,
            })
            .map_err(|_| self.terminal_reason())
    }

    /// Queue a reply to a peer frame. Counted against `max_pending_replies`.
    fn send_reply(&self, frame: Frame) {
        self.pending_replies.fetch_add(1, Ordering::AcqRel);
        let queued = self.frame_tx.send(Outbound { frame, reply: true });
        if queued.is_err() {
            self.reply_written();
        }
    }

    fn reply_written(&self) {
        self.pending_replies.fetch_sub(1, Ordering::AcqRel);
        self.replies_drained.notify_one();
    }

    /// Wait until the writer has room for another reply.
    ///
    /// A peer that keeps sending but never reads stalls here instead of
    /// growing the outbound queue.
    async fn reply_room(&self) {
        let limit = self.config.max_pending_replies.max(1);
        let mut stalled = false;
        loop {
            let drained = self.replies_drained.notified();
            if self.pending_replies.load(Ordering::Acquire) < limit {
                if stalled {
                    debug!("Peer is reading again, resuming");
                }
                return;
            }
            if !stalled {
                debug!("{} replies unread by peer, pausing reads", limit);
                stalled = true;
            }
            drained.await;
        }
    }

    pub(crate) fn record_bytes_out(&self, n: usize) {
        self.counters.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Drop a stream from the table if it is still the registered one
    pub(crate) fn remove_stream(&self, stream: &Arc<StreamShared>) {
        let mut table = lock(&self.table);
        if let Some(current) = table.streams.get(&stream.id) {
            if Arc::ptr_eq(current, stream) {
                table.streams.remove(&stream.id);
            }
        }
    }

    fn terminal_reason(&self) -> MuxError {
        lock(&self.close_reason)
            .clone()
            .unwrap_or(MuxError::SessionClosed)
    }

    fn lookup(&self, id: StreamId) -> Option<Arc<StreamShared>> {
        lock(&self.table).streams.get(&id).cloned()
    }

    fn take(&self, id: StreamId) -> Option<Arc<StreamShared>> {
        lock(&self.table).streams.remove(&id)
    }

    /// Tear the multiplexer down once. Returns false if it was already closed.
    fn shutdown(&self, reason: MuxError, go_away: Option<GoAwayCode>) -> bool {
        let streams: Vec<_> = {
            let mut table = lock(&self.table);
            if table.closed {
                return false;
            }
            table.closed = true;
            *lock(&self.close_reason) = Some(reason.clone());
            table.streams.drain().map(|(_, s)| s).collect()
        };

        debug!(
            "Multiplexer ({:?}) closing: {} ({} open streams)",
            self.role,
            reason,
            streams.len()
        );

        if let Some(code) = go_away {
            let _ = self.send_frame(Frame::GoAway { code });
        }
        for stream in streams {
            stream.fail(reason.clone());
        }
        lock(&self.pings).clear();
        self.cancel.cancel();
        true
    }

    fn register_outbound(self: &Arc<Self>, open_tx: OpenResult) -> Result<Stream, MuxError> {
        let shared = {
            let mut table = lock(&self.table);
            if table.closed {
                return Err(self.terminal_reason());
            }
            if table.streams.len() >= self.config.max_streams {
                return Err(MuxError::StreamLimitExceeded);
            }
            // Ids are never reused, so the space runs out rather than wraps
            let raw = self.next_id.load(Ordering::Relaxed);
            if raw >= u32::MAX - 1 {
                return Err(MuxError::StreamLimitExceeded);
            }
            self.next_id.store(raw + 2, Ordering::Relaxed);
            let id = StreamId::new(raw);
            let shared = StreamShared::new(id, self.config.initial_window, Some(open_tx));
            table.streams.insert(id, Arc::clone(&shared));
            shared
        };

        let stream = Stream::new(Arc::clone(&shared), Arc::clone(self));
        self.counters.streams_opened.fetch_add(1, Ordering::Relaxed);
        self.send_frame(Frame::Open {
            stream_id: shared.id,
        })?;
        trace!("Opening {}", shared.id);
        Ok(stream)
    }

    fn refuse(&self, id: StreamId, code: ResetCode) {
        self.send_reply(Frame::Reset {
            stream_id: id,
            code,
        });
    }

    fn on_remote_open(
        self: &Arc<Self>,
        id: StreamId,
        accept_tx: &mpsc::Sender<Stream>,
    ) -> Result<(), Halt> {
        if !self.role.is_remote_id(id) {
            warn!("Peer opened {} with our parity", id);
            self.refuse(id, ResetCode::ProtocolError);
            return Ok(());
        }

        let shared = {
            let mut table = lock(&self.table);
            if table.closed {
                return Ok(());
            }
            if let Some(existing) = table.streams.remove(&id) {
                drop(table);
                warn!("Duplicate open for {}", id);
                existing.fail(MuxError::StreamReset(ResetCode::ProtocolError));
                self.refuse(id, ResetCode::ProtocolError);
                return Ok(());
            }
            if table.streams.len() >= self.config.max_streams || accept_tx.capacity() == 0 {
                drop(table);
                debug!("Refusing {}: stream limit or accept backlog reached", id);
                self.refuse(id, ResetCode::Refused);
                return Ok(());
            }
            let shared = StreamShared::new(id, self.config.initial_window, None);
            table.streams.insert(id, Arc::clone(&shared));
            shared
        };

        self.send_reply(Frame::OpenAck { stream_id: id });
        self.counters
            .streams_accepted
            .fetch_add(1, Ordering::Relaxed);

        // If the acceptor is gone the stream is dropped here and reset
        let _ = accept_tx.try_send(Stream::new(shared, Arc::clone(self)));
        Ok(())
    }

    fn handle_frame(
        self: &Arc<Self>,
        frame: Frame,
        accept_tx: &mpsc::Sender<Stream>,
    ) -> Result<(), Halt> {
        match frame {
            Frame::Open { stream_id } => return self.on_remote_open(stream_id, accept_tx),
            Frame::OpenAck { stream_id } => {
                if let Some(stream) = self.lookup(stream_id) {
                    stream.on_open_ack();
                }
            }
            Frame::Data { stream_id, payload } => {
                self.counters
                    .bytes_in
                    .fetch_add(payload.len() as u64, Ordering::Relaxed);
                match self.lookup(stream_id) {
                    Some(stream) => {
                        if let Err(code) = stream.on_data(payload) {
                            warn!("Resetting {}: {}", stream_id, code);
                            self.remove_stream(&stream);
                            stream.fail(MuxError::StreamReset(code));
                            self.refuse(stream_id, code);
                        }
                    }
                    None => trace!("Dropping data for unknown {}", stream_id),
                }
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => {
                if let Some(stream) = self.lookup(stream_id) {
                    stream.on_window_update(increment);
                }
            }
            Frame::Close { stream_id } => {
                if let Some(stream) = self.lookup(stream_id) {
                    if stream.on_close() {
                        self.remove_stream(&stream);
                    }
                }
            }
            Frame::Reset { stream_id, code } => {
                if let Some(stream) = self.take(stream_id) {
                    let err = match code {
                        ResetCode::Refused => MuxError::StreamLimitExceeded,
                        other => MuxError::StreamReset(other),
                    };
                    stream.fail(err);
                }
            }
            Frame::Ping { nonce } => {
                self.last_ping_ms
                    .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
                self.heard_ping.store(true, Ordering::Relaxed);
                self.send_reply(Frame::Pong { nonce });
            }
            Frame::Pong { nonce } => {
                if let Some(tx) = lock(&self.pings).remove(&nonce) {
                    let _ = tx.send(());
                }
            }
            Frame::GoAway { code } => return Err(Halt::GoAway(code)),
            Frame::Hello(_) | Frame::HelloAck(_) => {
                return Err(Halt::Violation(
                    "handshake frame on an established session".into(),
                ));
            }
        }
        Ok(())
    }

    async fn ping(&self) -> Result<Duration, MuxError> {
        let nonce = rand::random::<u64>();
        let (tx, rx) = oneshot::channel();
        {
            let mut pings = lock(&self.pings);
            if self.cancel.is_cancelled() {
                return Err(self.terminal_reason());
            }
            pings.insert(nonce, tx);
        }
        let _guard = PingGuard { mux: self, nonce };

        let started = Instant::now();
        self.send_frame(Frame::Ping { nonce })?;
        tokio::select! {
            pong = rx => pong
                .map(|_| started.elapsed())
                .map_err(|_| self.terminal_reason()),
            _ = self.cancel.cancelled() => Err(self.terminal_reason()),
        }
    }
}

/// Forgets an outstanding ping nonce when the caller stops waiting
struct PingGuard<'a> {
    mux: &'a MuxShared,
    nonce: u64,
}

impl Drop for PingGuard<'_> {
    fn drop(&mut self) {
        lock(&self.mux.pings).remove(&self.nonce);
    }
}

async fn read_loop<S>(shared: Arc<MuxShared>, mut frames: S, accept_tx: mpsc::Sender<Stream>)
where
    S: futures::Stream<Item = Result<Frame, ProtocolError>> + Unpin,
{
    let (reason, go_away) = loop {
        let next = tokio::select! {
            _ = shared.cancel.cancelled() => return,
            next = async {
                shared.reply_room().await;
                frames.next().await
            } => next,
        };

        match next {
            Some(Ok(frame)) => match shared.handle_frame(frame, &accept_tx) {
                Ok(()) => {}
                Err(Halt::GoAway(code)) => {
                    debug!("Peer sent GoAway: {}", code);
                    *lock(&shared.remote_go_away) = Some(code);
                    break (MuxError::SessionClosed, None);
                }
                Err(Halt::Violation(msg)) => {
                    warn!("Protocol violation: {}", msg);
                    break (MuxError::Protocol(msg), Some(GoAwayCode::ProtocolError));
                }
            },
            Some(Err(ProtocolError::Io(e))) => {
                break (MuxError::ConnectionLost(e.to_string()), None);
            }
            Some(Err(e)) => {
                warn!("Failed to decode frame: {}", e);
                break (MuxError::Protocol(e.to_string()), Some(GoAwayCode::ProtocolError));
            }
            None => {
                break (
                    MuxError::ConnectionLost("connection closed by peer".into()),
                    None,
                );
            }
        }
    };

    shared.shutdown(reason, go_away);
}

async fn write_loop<S>(
    shared: Arc<MuxShared>,
    mut sink: S,
    mut frame_rx: mpsc::UnboundedReceiver<Outbound>,
) where
    S: Sink<Frame, Error = ProtocolError> + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            next = frame_rx.recv() => next,
        };
        let Some(next) = next else { break };

        let batch = async {
            feed(&shared, &mut sink, next).await?;
            while let Ok(next) = frame_rx.try_recv() {
                feed(&shared, &mut sink, next).await?;
            }
            sink.flush().await
        };
        // A peer that stopped reading must not pin the writer after close
        let result = tokio::select! {
            result = batch => result,
            _ = shared.cancel.cancelled() => break,
        };

        if let Err(e) = result {
            shared.shutdown(MuxError::ConnectionLost(e.to_string()), None);
            return;
        }
    }

    // Best-effort delivery of frames queued before the close (GoAway, resets)
    let drain = async {
        while let Ok(next) = frame_rx.try_recv() {
            feed(&shared, &mut sink, next).await?;
        }
        sink.close().await
    };
    match timeout(shared.config.close_flush_timeout, drain).await {
        Ok(Ok(())) => trace!("Writer flushed and closed"),
        Ok(Err(e)) => trace!("Writer close failed: {}", e),
        Err(_) => debug!("Timed out flushing frames on close"),
    }
}

async fn feed<S>(shared: &MuxShared, sink: &mut S, next: Outbound) -> Result<(), ProtocolError>
where
    S: Sink<Frame, Error = ProtocolError> + Unpin,
{
    let result = sink.feed(next.frame).await;
    if next.reply {
        shared.reply_written();
    }
    result
}

async fn keepalive_loop(shared: Arc<MuxShared>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match timeout(shared.config.keepalive_timeout, shared.ping()).await {
            Ok(Ok(rtt)) => trace!("Keepalive rtt {:?}", rtt),
            Ok(Err(_)) => return,
            Err(_) => {
                warn!(
                    "No pong within {:?}, dropping connection",
                    shared.config.keepalive_timeout
                );
                shared.shutdown(MuxError::ConnectionLost("keepalive timeout".into()), None);
                return;
            }
        }
    }
}

/// Stream multiplexer over one physical connection.
///
/// Both ends may open streams. Closing is idempotent: the first close
/// reason wins and every open stream fails with it.
pub struct Multiplexer {
    shared: Arc<MuxShared>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Stream>>,
}

impl Multiplexer {
    /// Start a multiplexer on a raw byte stream
    pub fn new<T>(io: T, role: Role, config: MuxConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::from_framed(Framed::new(io, FrameCodec::new()), role, config)
    }

    /// Start a multiplexer on a connection that already exchanged frames.
    ///
    /// Any bytes the codec buffered past the handshake are kept.
    pub fn from_framed<T>(framed: Framed<T, FrameCodec>, role: Role, config: MuxConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (sink, frames) = framed.split();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog.max(1));
        let keepalive = config.keepalive_interval;

        let shared = Arc::new(MuxShared {
            role,
            table: Mutex::new(StreamTable {
                streams: HashMap::new(),
                closed: false,
            }),
            next_id: AtomicU32::new(role.first_stream_id()),
            frame_tx,
            pending_replies: AtomicUsize::new(0),
            replies_drained: Notify::new(),
            pings: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            close_reason: Mutex::new(None),
            remote_go_away: Mutex::new(None),
            epoch: Instant::now(),
            last_ping_ms: AtomicU64::new(0),
            heard_ping: AtomicBool::new(false),
            counters: Counters::default(),
            config,
        });

        tokio::spawn(read_loop(Arc::clone(&shared), frames, accept_tx));
        tokio::spawn(write_loop(Arc::clone(&shared), sink, frame_rx));
        if let Some(interval) = keepalive {
            tokio::spawn(keepalive_loop(Arc::clone(&shared), interval));
        }

        Self {
            shared,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
        }
    }

    /// Open a new stream and wait for the peer to acknowledge it
    pub async fn open(&self) -> Result<Stream, MuxError> {
        let (tx, rx) = oneshot::channel();
        let stream = self.shared.register_outbound(tx)?;
        match rx.await {
            Ok(Ok(())) => Ok(stream),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(self.shared.terminal_reason()),
        }
    }

    /// Wait for the next stream opened by the peer
    pub async fn accept(&self) -> Result<Stream, MuxError> {
        let mut rx = self.accept_rx.lock().await;
        tokio::select! {
            stream = rx.recv() => stream.ok_or_else(|| self.shared.terminal_reason()),
            _ = self.shared.cancel.cancelled() => Err(self.shared.terminal_reason()),
        }
    }

    /// Round-trip a ping to the peer
    pub async fn ping(&self) -> Result<Duration, MuxError> {
        self.shared.ping().await
    }

    /// Close with [`GoAwayCode::Normal`]
    pub fn close(&self) {
        self.close_with(GoAwayCode::Normal);
    }

    /// Send `GoAway(code)` and fail every stream. Later calls do nothing.
    pub fn close_with(&self, code: GoAwayCode) {
        self.shared.shutdown(MuxError::SessionClosed, Some(code));
    }

    /// Wait until the multiplexer shuts down and return why
    pub async fn closed(&self) -> MuxError {
        self.shared.cancel.cancelled().await;
        self.shared.terminal_reason()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Why the multiplexer closed, if it has
    pub fn close_reason(&self) -> Option<MuxError> {
        lock(&self.shared.close_reason).clone()
    }

    /// Code of the `GoAway` received from the peer, if any
    pub fn remote_go_away(&self) -> Option<GoAwayCode> {
        *lock(&self.shared.remote_go_away)
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn config(&self) -> &MuxConfig {
        &self.shared.config
    }

    pub fn stream_count(&self) -> usize {
        lock(&self.shared.table).streams.len()
    }

    pub fn stats(&self) -> MuxStats {
        let counters = &self.shared.counters;
        MuxStats {
            bytes_in: counters.bytes_in.load(Ordering::Relaxed),
            bytes_out: counters.bytes_out.load(Ordering::Relaxed),
            streams_opened: counters.streams_opened.load(Ordering::Relaxed),
            streams_accepted: counters.streams_accepted.load(Ordering::Relaxed),
            open_streams: self.stream_count(),
        }
    }

    /// Time since the peer last pinged us, or since the multiplexer started
    /// if it never has
    pub fn since_last_ping(&self) -> Duration {
        let elapsed = self.shared.epoch.elapsed();
        if !self.shared.heard_ping.load(Ordering::Relaxed) {
            return elapsed;
        }
        let last = Duration::from_millis(self.shared.last_ping_ms.load(Ordering::Relaxed));
        elapsed.saturating_sub(last)
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.shared.shutdown(MuxError::SessionClosed, Some(GoAwayCode::Normal));
    }
}
