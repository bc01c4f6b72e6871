//! Agent-facing server
//!
//! Accepts agent connections, runs the handshake and serves each session
//! until it ends.

mod handler;
mod handshake;
mod listener;

pub use handler::serve_connection;
pub use handshake::{handshake, HandshakeError};
pub use listener::BrokerServer;
