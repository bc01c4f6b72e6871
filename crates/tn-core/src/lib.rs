//! tn-core: Shared configuration, errors and types for the tunnel broker
//!
//! This crate provides the configuration structures, the error taxonomy and
//! the identity types used by both the broker and the agent.

pub mod config;
pub mod error;
pub mod logging;
pub mod time;
pub mod types;

pub use error::{ConfigError, TimeoutKind, TunnelError};
pub use types::{ClientIdentity, SessionId};
