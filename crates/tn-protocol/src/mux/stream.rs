//! Virtual streams carried by a multiplexer

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::oneshot;

use crate::codec::Frame;
use crate::message::ResetCode;
use crate::stream_id::StreamId;

use super::connection::MuxShared;
use super::error::MuxError;
use super::lock;

/// Resolves a pending `open()` once the peer acks or refuses
pub(crate) type OpenResult = oneshot::Sender<Result<(), MuxError>>;

/// Per-stream state shared between the stream handle and the reader task
pub(crate) struct StreamShared {
    pub(crate) id: StreamId,
    inner: Mutex<StreamInner>,
}

struct StreamInner {
    /// Received payload not yet read by the application
    recv_buf: VecDeque<Bytes>,
    recv_buffered: usize,
    /// Bytes the peer may still send before it must wait for a window update
    recv_window: u32,
    /// Bytes consumed by the application but not yet granted back
    unacked: u32,
    /// Bytes we may still send
    send_window: u32,
    remote_closed: bool,
    local_closed: bool,
    error: Option<MuxError>,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
    open_tx: Option<OpenResult>,
}

impl StreamShared {
    pub(crate) fn new(id: StreamId, window: u32, open_tx: Option<OpenResult>) -> Arc<Self> {
        Arc::new(Self {
            id,
            inner: Mutex::new(StreamInner {
                recv_buf: VecDeque::new(),
                recv_buffered: 0,
                recv_window: window,
                unacked: 0,
                send_window: window,
                remote_closed: false,
                local_closed: false,
                error: None,
                read_waker: None,
                write_waker: None,
                open_tx,
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, StreamInner> {
        lock(&self.inner)
    }

    /// Peer acknowledged our open
    pub(crate) fn on_open_ack(&self) {
        if let Some(tx) = self.state().open_tx.take() {
            let _ = tx.send(Ok(()));
        }
    }

    /// Buffer incoming payload.
    ///
    /// Returns the reset code to send when the peer broke the stream rules.
    pub(crate) fn on_data(&self, payload: Bytes) -> Result<(), ResetCode> {
        let mut inner = self.state();
        if inner.error.is_some() {
            return Ok(());
        }
        if inner.remote_closed {
            return Err(ResetCode::ProtocolError);
        }
        let len = payload.len();
        if len > inner.recv_window as usize {
            return Err(ResetCode::FlowControl);
        }
        if len == 0 {
            return Ok(());
        }

        inner.recv_window -= len as u32;
        inner.recv_buffered += len;
        inner.recv_buf.push_back(payload);
        if let Some(waker) = inner.read_waker.take() {
            waker.wake();
        }
        Ok(())
    }

    pub(crate) fn on_window_update(&self, increment: u32) {
        let mut inner = self.state();
        inner.send_window = inner.send_window.saturating_add(increment);
        if let Some(waker) = inner.write_waker.take() {
            waker.wake();
        }
    }

    /// Peer half-closed. Returns true when both directions are now closed.
    pub(crate) fn on_close(&self) -> bool {
        let mut inner = self.state();
        inner.remote_closed = true;
        if let Some(waker) = inner.read_waker.take() {
            waker.wake();
        }
        inner.local_closed
    }

    /// Fail every pending and future operation with `err`
    pub(crate) fn fail(&self, err: MuxError) {
        let mut inner = self.state();
        if inner.error.is_none() {
            inner.error = Some(err.clone());
        }
        if let Some(tx) = inner.open_tx.take() {
            let _ = tx.send(Err(err));
        }
        if let Some(waker) = inner.read_waker.take() {
            waker.wake();
        }
        if let Some(waker) = inner.write_waker.take() {
            waker.wake();
        }
    }
}

/// A virtual bidirectional byte stream.
///
/// Implements [`AsyncRead`] and [`AsyncWrite`]. Writes suspend while the
/// peer's receive window is exhausted. `shutdown()` half-closes the write
/// direction; dropping a stream that is not closed in both directions
/// resets it.
pub struct Stream {
    shared: Arc<StreamShared>,
    mux: Arc<MuxShared>,
}

impl Stream {
    pub(crate) fn new(shared: Arc<StreamShared>, mux: Arc<MuxShared>) -> Self {
        Self { shared, mux }
    }

    /// Stream identifier, unique within its multiplexer
    pub fn id(&self) -> StreamId {
        self.shared.id
    }

    /// Abort the stream, notifying the peer
    pub fn reset(self) {
        self.shared.fail(MuxError::StreamReset(ResetCode::Cancel));
        self.mux.remove_stream(&self.shared);
        let _ = self.mux.send_frame(Frame::Reset {
            stream_id: self.shared.id,
            code: ResetCode::Cancel,
        });
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream").field("id", &self.shared.id).finish()
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut inner = this.shared.state();

        if inner.recv_buffered > 0 {
            let mut copied = 0;
            while buf.remaining() > 0 {
                let Some(chunk) = inner.recv_buf.front_mut() else {
                    break;
                };
                let n = chunk.len().min(buf.remaining());
                buf.put_slice(&chunk[..n]);
                chunk.advance(n);
                if chunk.is_empty() {
                    inner.recv_buf.pop_front();
                }
                copied += n;
            }
            inner.recv_buffered -= copied;
            inner.unacked += copied as u32;

            // Grant window back in batches, and never to a peer that is done
            let grant = if inner.unacked >= this.mux.config.window_update_threshold()
                && !inner.remote_closed
                && inner.error.is_none()
            {
                let increment = std::mem::take(&mut inner.unacked);
                inner.recv_window += increment;
                Some(increment)
            } else {
                None
            };
            drop(inner);

            if let Some(increment) = grant {
                let _ = this.mux.send_frame(Frame::WindowUpdate {
                    stream_id: this.shared.id,
                    increment,
                });
            }
            return Poll::Ready(Ok(()));
        }

        if let Some(err) = &inner.error {
            return Poll::Ready(Err(err.clone().into()));
        }
        if inner.remote_closed {
            return Poll::Ready(Ok(()));
        }

        inner.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let this = self.get_mut();
        let mut inner = this.shared.state();

        if let Some(err) = &inner.error {
            return Poll::Ready(Err(err.clone().into()));
        }
        if inner.local_closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream already closed for writing",
            )));
        }
        if inner.send_window == 0 {
            inner.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let n = buf
            .len()
            .min(inner.send_window as usize)
            .min(this.mux.config.max_frame_payload);
        inner.send_window -= n as u32;
        drop(inner);

        this.mux.send_frame(Frame::Data {
            stream_id: this.shared.id,
            payload: Bytes::copy_from_slice(&buf[..n]),
        })?;
        this.mux.record_bytes_out(n);

        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are handed to the writer task as soon as they are produced
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut inner = this.shared.state();

        if inner.local_closed {
            return Poll::Ready(Ok(()));
        }
        if let Some(err) = &inner.error {
            return Poll::Ready(Err(err.clone().into()));
        }
        inner.local_closed = true;
        let finished = inner.remote_closed;
        drop(inner);

        this.mux.send_frame(Frame::Close {
            stream_id: this.shared.id,
        })?;
        if finished {
            this.mux.remove_stream(&this.shared);
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let unfinished = {
            let mut inner = self.shared.state();
            let finished = inner.error.is_some() || (inner.local_closed && inner.remote_closed);
            if !finished {
                inner.error = Some(MuxError::StreamReset(ResetCode::Cancel));
            }
            !finished
        };

        self.mux.remove_stream(&self.shared);
        if unfinished {
            tracing::trace!("Resetting abandoned {}", self.shared.id);
            let _ = self.mux.send_frame(Frame::Reset {
                stream_id: self.shared.id,
                code: ResetCode::Cancel,
            });
        }
    }
}
