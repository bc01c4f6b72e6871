//! Tunnel management for connecting to the broker

mod connector;
mod reconnect;

pub use connector::{ActiveTunnel, ConnectionError, TunnelConnector};
pub use reconnect::ExponentialBackoff;
