//! Broker configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::{duration_secs, option_duration_secs};
use crate::error::ConfigError;

/// Configuration for the broker daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Address agents connect to
    pub bind_address: String,

    /// Time allowed for the Hello/HelloAck exchange
    #[serde(with = "duration_secs")]
    pub handshake_timeout: Duration,

    /// Interval at which agents are asked to ping
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,

    /// Silence tolerated before a session is drained (defaults to twice the
    /// heartbeat interval)
    #[serde(with = "option_duration_secs")]
    pub heartbeat_grace: Option<Duration>,

    /// Time allowed for the agent to acknowledge a new stream
    #[serde(with = "duration_secs")]
    pub dial_timeout: Duration,

    /// A routed stream with no traffic in either direction for this long is closed
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,

    /// Optional cap on the total lifetime of a routed stream
    #[serde(with = "option_duration_secs")]
    pub max_stream_lifetime: Option<Duration>,

    /// Maximum concurrent streams per session
    pub max_streams_per_session: u32,

    /// Per-stream receive window in bytes
    pub stream_window: u32,

    /// Maximum number of registered sessions
    pub max_sessions: Option<usize>,

    /// Path to the API key file
    pub api_keys_path: PathBuf,

    /// Address for the HTTP admin endpoint (disabled when unset)
    pub admin_address: Option<String>,

    /// Public TCP listeners forwarded to agents
    pub edge: Vec<EdgeBinding>,
}

/// One public TCP listener routed to a single identity's tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeBinding {
    /// Public address to accept callers on
    pub listen: String,
    /// Identity whose agent serves the callers
    pub identity: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:7835".to_string(),
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_grace: None,
            dial_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
            max_stream_lifetime: None,
            max_streams_per_session: tn_protocol::mux::DEFAULT_MAX_STREAMS as u32,
            stream_window: tn_protocol::mux::DEFAULT_WINDOW_SIZE,
            max_sessions: None,
            api_keys_path: super::default_config_dir().join("api_keys.toml"),
            admin_address: None,
            edge: Vec::new(),
        }
    }
}

impl BrokerConfig {
    /// Effective heartbeat grace window
    pub fn heartbeat_grace(&self) -> Duration {
        self.heartbeat_grace.unwrap_or(self.heartbeat_interval * 2)
    }

    /// Reject settings the broker cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "heartbeat_interval must be greater than zero".into(),
            ));
        }
        if self.heartbeat_grace() < self.heartbeat_interval {
            return Err(ConfigError::Invalid(format!(
                "heartbeat_grace ({:?}) is shorter than heartbeat_interval ({:?})",
                self.heartbeat_grace(),
                self.heartbeat_interval
            )));
        }
        if self.stream_window == 0 {
            return Err(ConfigError::Invalid("stream_window must be non-zero".into()));
        }
        if self.max_streams_per_session == 0 {
            return Err(ConfigError::Invalid(
                "max_streams_per_session must be non-zero".into(),
            ));
        }
        for binding in &self.edge {
            if binding.identity.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "edge listener {} has no identity",
                    binding.listen
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = BrokerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.heartbeat_grace(), Duration::from_secs(30));
        assert_eq!(config.stream_window, 256 * 1024);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: BrokerConfig = toml::from_str(
            r#"
            bind_address = "127.0.0.1:7000"
            heartbeat_interval = 5
            max_stream_lifetime = 600

            [[edge]]
            listen = "0.0.0.0:8080"
            identity = "u1"
            "#,
        )
        .unwrap();

        assert_eq!(config.bind_address, "127.0.0.1:7000");
        assert_eq!(config.heartbeat_grace(), Duration::from_secs(10));
        assert_eq!(config.max_stream_lifetime, Some(Duration::from_secs(600)));
        assert_eq!(config.dial_timeout, Duration::from_secs(10));
        assert_eq!(config.edge.len(), 1);
    }

    #[test]
    fn test_validate_rejects_short_grace() {
        let config = BrokerConfig {
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_grace: Some(Duration::from_secs(5)),
            ..BrokerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_zero_window() {
        let config = BrokerConfig {
            stream_window: 0,
            ..BrokerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
