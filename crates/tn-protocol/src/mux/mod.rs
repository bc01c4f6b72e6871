//! Stream multiplexing over one physical connection
//!
//! A [`Multiplexer`] carries many independent [`Stream`]s with per-stream
//! credit-based flow control. Remote-opened streams are handed out by
//! [`Multiplexer::accept`]; local ones come from [`Multiplexer::open`].

mod config;
mod connection;
mod error;
mod stream;

use std::sync::{Mutex, MutexGuard};

pub use config::{MuxConfig, Role, DEFAULT_MAX_STREAMS, DEFAULT_WINDOW_SIZE};
pub use connection::{MuxStats, Multiplexer};
pub use error::MuxError;
pub use stream::Stream;

/// Lock a std mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
