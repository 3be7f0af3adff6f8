//! Broker and client configuration
//!
//! The broker reads a TOML file in which every section and field has a
//! default, so an empty file (or no file at all) yields a working local
//! broker. Agents connecting over the network use [`ClientConfig`].

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Allowed agent public keys
static AGENT_ID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9._:+/=-]{1,256}$").expect("agent id pattern is valid")
});

/// Main broker configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BrokerConfig {
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub conversations: ConversationConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

/// Listener and session limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Deadline for the whole handshake exchange
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Largest accepted frame body in bytes
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

/// Which failures are reported back to the agent that caused them
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct NotificationConfig {
    /// Send a dialogue error when the destination is not connected
    #[serde(default = "default_true")]
    pub routing_errors: bool,
    /// Send an error reply when a negotiation message breaks threading
    #[serde(default)]
    pub protocol_errors: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            routing_errors: true,
            protocol_errors: false,
        }
    }
}

/// Idle conversation reclamation; off unless `idle_timeout_secs` is set
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<u64>,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: None,
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl ConversationConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Health check server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_health_port")]
    pub port: u16,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_health_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    10000
}

fn default_handshake_timeout_ms() -> u64 {
    5000
}

fn default_max_frame_bytes() -> usize {
    crate::protocol::DEFAULT_MAX_FRAME_BYTES
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_health_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to render TOML: {0}")]
    TomlRender(#[from] toml::ser::Error),
    #[error("Invalid agent ID format: {0}")]
    InvalidAgentId(String),
    #[error("Invalid broker URL: {0}")]
    InvalidUrl(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BrokerConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: BrokerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.host.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "broker.host must not be empty".to_string(),
            ));
        }
        if self.broker.handshake_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "broker.handshake_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.broker.max_frame_bytes == 0 {
            return Err(ConfigError::InvalidConfig(
                "broker.max_frame_bytes must be greater than zero".to_string(),
            ));
        }
        if self.conversations.idle_timeout_secs == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "conversations.idle_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.conversations.sweep_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "conversations.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.health.enabled && self.health.port == 0 {
            return Err(ConfigError::InvalidConfig(
                "health.port must be set when the health server is enabled".to_string(),
            ));
        }
        Ok(())
    }

    /// Address the broker listens on
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.broker.host, self.broker.port)
            .parse()
            .map_err(|e| ConfigError::InvalidConfig(format!("broker address: {e}")))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.broker.handshake_timeout_ms)
    }

    /// Create a test configuration: ephemeral port, every notification on
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[broker]
port = 0
handshake_timeout_ms = 1000

[notifications]
routing_errors = true
protocol_errors = true
"#;
        Self::from_toml_str(toml_content).expect("Test config should parse")
    }
}

/// How an agent reaches the broker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    /// `tcp://host:port`
    pub broker_url: String,
    pub public_key: String,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

impl ClientConfig {
    pub fn new(broker_url: impl Into<String>, public_key: impl Into<String>) -> Self {
        Self {
            broker_url: broker_url.into(),
            public_key: public_key.into(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_agent_id(&self.public_key)?;
        self.broker_address().map(|_| ())
    }

    /// `host:port` taken from the broker URL
    pub fn broker_address(&self) -> Result<String, ConfigError> {
        let url = Url::parse(&self.broker_url)
            .map_err(|e| ConfigError::InvalidUrl(format!("{}: {e}", self.broker_url)))?;
        if url.scheme() != "tcp" {
            return Err(ConfigError::InvalidUrl(format!(
                "{}: scheme must be tcp",
                self.broker_url
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| ConfigError::InvalidUrl(format!("{}: missing host", self.broker_url)))?;
        let port = url
            .port()
            .ok_or_else(|| ConfigError::InvalidUrl(format!("{}: missing port", self.broker_url)))?;
        Ok(format!("{host}:{port}"))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Validate an agent public key
pub fn validate_agent_id(agent_id: &str) -> Result<(), ConfigError> {
    if !AGENT_ID_PATTERN.is_match(agent_id) {
        return Err(ConfigError::InvalidAgentId(format!(
            "Agent ID '{agent_id}' must match pattern [A-Za-z0-9._:+/=-]{{1,256}}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = BrokerConfig::from_toml_str("").unwrap();
        assert_eq!(config.broker.host, "127.0.0.1");
        assert_eq!(config.broker.port, 10000);
        assert_eq!(config.broker.max_frame_bytes, 1024 * 1024);
        assert!(config.notifications.routing_errors);
        assert!(!config.notifications.protocol_errors);
        assert_eq!(config.conversations.idle_timeout(), None);
        assert!(!config.health.enabled);
    }

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[broker]
host = "0.0.0.0"
port = 3333
handshake_timeout_ms = 250
max_frame_bytes = 4096

[notifications]
routing_errors = false
protocol_errors = true

[conversations]
idle_timeout_secs = 600
sweep_interval_secs = 5

[health]
enabled = true
port = 9090
"#;

        let config = BrokerConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.listen_addr().unwrap().port(), 3333);
        assert_eq!(config.handshake_timeout(), Duration::from_millis(250));
        assert!(!config.notifications.routing_errors);
        assert_eq!(
            config.conversations.idle_timeout(),
            Some(Duration::from_secs(600))
        );
        assert_eq!(config.conversations.sweep_interval(), Duration::from_secs(5));
        assert_eq!(config.health.port, 9090);
    }

    #[test]
    fn test_invalid_values_rejected() {
        for toml_content in [
            "[broker]\nhandshake_timeout_ms = 0",
            "[broker]\nmax_frame_bytes = 0",
            "[conversations]\nidle_timeout_secs = 0",
            "[health]\nenabled = true\nport = 0",
        ] {
            let result = BrokerConfig::from_toml_str(toml_content);
            assert!(
                matches!(result, Err(ConfigError::InvalidConfig(_))),
                "accepted: {toml_content}"
            );
        }
    }

    #[test]
    fn test_toml_roundtrip_for_show() {
        let config = BrokerConfig::test_config();
        let rendered = config.to_toml_string().unwrap();
        assert_eq!(BrokerConfig::from_toml_str(&rendered).unwrap(), config);
    }

    #[test]
    fn test_agent_id_validation() {
        assert!(validate_agent_id("Agent1").is_ok());
        assert!(validate_agent_id("base64+key/with=padding").is_ok());
        assert!(validate_agent_id("").is_err());
        assert!(validate_agent_id("has space").is_err());
        assert!(validate_agent_id(&"x".repeat(257)).is_err());
    }

    #[test]
    fn test_client_config() {
        let client = ClientConfig::new("tcp://localhost:10000", "Agent1");
        assert!(client.validate().is_ok());
        assert_eq!(client.broker_address().unwrap(), "localhost:10000");

        let wrong_scheme = ClientConfig::new("mqtt://localhost:10000", "Agent1");
        assert!(matches!(
            wrong_scheme.validate(),
            Err(ConfigError::InvalidUrl(_))
        ));

        let no_port = ClientConfig::new("tcp://localhost", "Agent1");
        assert!(no_port.broker_address().is_err());
    }
}
