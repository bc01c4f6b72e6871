//! Multiplexer configuration

use std::time::Duration;

use crate::stream_id::StreamId;

/// Default per-stream receive window (256 KiB)
pub const DEFAULT_WINDOW_SIZE: u32 = 256 * 1024;

/// Default maximum concurrent streams per multiplexer
pub const DEFAULT_MAX_STREAMS: usize = 256;

/// Which end of the physical connection this multiplexer is.
///
/// The role decides stream ID parity so both ends can open streams
/// without colliding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The dialing side (agent); allocates odd stream IDs
    Client,
    /// The accepting side (broker); allocates even stream IDs
    Server,
}

impl Role {
    /// First stream ID this role allocates
    pub(crate) fn first_stream_id(&self) -> u32 {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }

    /// Whether `id` was allocated by the remote end
    pub(crate) fn is_remote_id(&self, id: StreamId) -> bool {
        match self {
            Role::Client => !id.is_client_initiated(),
            Role::Server => id.is_client_initiated(),
        }
    }
}

/// Tunables for a [`Multiplexer`](super::Multiplexer)
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Maximum concurrently open streams; remote opens beyond it are reset
    pub max_streams: usize,
    /// Initial receive window per stream, also the peer's initial send window
    pub initial_window: u32,
    /// Largest data payload put into a single frame
    pub max_frame_payload: usize,
    /// Remote-opened streams waiting for `accept()`
    pub accept_backlog: usize,
    /// Send a ping on this interval (agent side keepalive)
    pub keepalive_interval: Option<Duration>,
    /// Declare the connection lost if a keepalive pong takes longer than this
    pub keepalive_timeout: Duration,
    /// Time allowed to flush queued frames when closing
    pub close_flush_timeout: Duration,
    /// Replies (pongs, open acks, refusals) the peer may leave unread
    /// before the reader stops reading from the connection
    pub max_pending_replies: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_streams: DEFAULT_MAX_STREAMS,
            initial_window: DEFAULT_WINDOW_SIZE,
            max_frame_payload: 32 * 1024,
            accept_backlog: 64,
            keepalive_interval: None,
            keepalive_timeout: Duration::from_secs(10),
            close_flush_timeout: Duration::from_secs(1),
            max_pending_replies: 1024,
        }
    }
}

impl MuxConfig {
    /// Enable keepalive pings on the given interval
    pub fn with_keepalive(mut self, interval: Duration) -> Self {
        self.keepalive_interval = Some(interval);
        self
    }

    /// Amount of consumed data after which a window update is sent
    pub(crate) fn window_update_threshold(&self) -> u32 {
        (self.initial_window / 2).max(1)
    }
}
