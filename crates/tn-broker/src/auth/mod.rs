//! Authentication of connecting agents
//!
//! The broker hands the credential from `Hello` to an [`Authenticator`]
//! and registers the session under the identity it returns.

mod keys;

use async_trait::async_trait;
use thiserror::Error;
use tn_core::{ClientIdentity, TunnelError};

pub use keys::{generate_api_key, hash_api_key, ApiKeyAuthenticator, ApiKeyEntry, ApiKeyFile};

/// Result of a successful authentication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthOutcome {
    /// Identity the session is registered under
    pub identity: ClientIdentity,
    /// Whether the owning account completed verification
    pub verified: bool,
    /// Whether the owner is an administrator
    pub is_admin: bool,
}

/// Authentication failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Unknown key or wrong secret
    #[error("invalid credential")]
    InvalidCredential,

    /// Key is past its expiry
    #[error("credential expired")]
    Expired,

    /// The credential store could not be consulted
    #[error("authenticator unavailable: {0}")]
    Unavailable(String),
}

impl From<AuthError> for TunnelError {
    fn from(err: AuthError) -> Self {
        TunnelError::AuthFailed(err.to_string())
    }
}

/// Maps a credential to an identity
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credential: &str) -> Result<AuthOutcome, AuthError>;
}
