//! tn-broker: Reverse-tunnel broker
//!
//! Agents behind NAT dial the broker once and keep a multiplexed session
//! open. The broker authenticates them, keeps one session per identity,
//! and routes external callers to fresh streams on those sessions.

pub mod admin;
pub mod auth;
pub mod edge;
pub mod metrics;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod state;

pub use registry::SessionRegistry;
pub use router::{RouteError, StreamRouter, TransferStats};
pub use server::BrokerServer;
pub use session::{DrainReason, Session, SessionState};
pub use state::BrokerState;
