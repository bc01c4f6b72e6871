//! Agent configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_secs;

/// Configuration for the tunnel agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Broker address to connect to
    pub broker_address: String,

    /// API key presented in the handshake (`<prefix>.<secret>`)
    pub api_key: String,

    /// Local service that tunneled streams are forwarded to
    pub local_address: String,

    /// Name reported to the broker (defaults to the hostname)
    pub hostname: Option<String>,

    /// TCP connect timeout for the broker connection
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Time allowed for the broker to answer the handshake
    #[serde(with = "duration_secs")]
    pub handshake_timeout: Duration,

    /// TCP connect timeout for the local service
    #[serde(with = "duration_secs")]
    pub local_connect_timeout: Duration,

    /// Backoff configuration for reconnections
    pub backoff: BackoffConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            broker_address: "localhost:7835".to_string(),
            api_key: String::new(),
            local_address: "127.0.0.1:8080".to_string(),
            hostname: None,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            local_connect_timeout: Duration::from_secs(5),
            backoff: BackoffConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Get the reported name, falling back to the hostname
    pub fn hostname(&self) -> String {
        self.hostname
            .clone()
            .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().into_owned())
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_secs")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_secs")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}
