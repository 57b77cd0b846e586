//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the client
//! runtime and the test server. All types derive Serde traits for
//! deserialization from config files.

use serde::{Deserialize, Serialize};

use crate::resilience::{DeadlinePolicy, Timeout};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Client runtime settings (deadlines, retries, transport).
    pub client: ClientConfig,

    /// Test server settings (adapter and controller).
    pub server: ServerConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Client runtime configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ClientConfig {
    /// Default deadlines for proxies created by the communicator.
    pub timeouts: TimeoutConfig,

    /// Connect retry loop settings.
    pub retries: RetryConfig,

    /// Socket-level settings.
    pub transport: TransportConfig,
}

/// Default deadlines, in milliseconds. `-1` disables a deadline.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Connection establishment timeout (TCP connect + validation).
    pub connect_ms: i64,

    /// Idle timeout: max time a read or write may stall on an open connection.
    pub idle_ms: i64,

    /// Invocation timeout: max time a caller waits for a reply.
    pub invocation_ms: i64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: -1,
            idle_ms: 60_000,
            invocation_ms: -1,
        }
    }
}

impl TimeoutConfig {
    /// Build the default deadline policy, rejecting invalid values.
    pub fn to_policy(&self) -> Result<DeadlinePolicy, crate::error::RpcError> {
        Ok(DeadlinePolicy::new(
            Timeout::from_millis(self.connect_ms)?,
            Timeout::from_millis(self.idle_ms)?,
            Timeout::from_millis(self.invocation_ms)?,
        ))
    }
}

/// Connect retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of establishment attempts when the handshake times out.
    pub connect_attempts: u32,

    /// Base delay for exponential backoff in milliseconds (0 disables backoff).
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 10,
            base_delay_ms: 0,
            max_delay_ms: 1000,
        }
    }
}

/// Socket-level settings for client connections.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// SO_SNDBUF for outgoing connections. OS default when unset.
    pub send_buffer_size: Option<u32>,

    /// SO_RCVBUF for outgoing connections. OS default when unset.
    pub recv_buffer_size: Option<u32>,

    /// Largest frame body accepted from the peer, in bytes.
    pub max_message_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            send_buffer_size: None,
            recv_buffer_size: None,
            max_message_size: 16 * 1024 * 1024,
        }
    }
}

/// Test server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Object adapter bind address (e.g., "127.0.0.1:12010").
    pub bind_address: String,

    /// Controller HTTP bind address.
    pub controller_address: String,

    /// SO_RCVBUF for accepted connections. Small values make holds bite fast.
    pub recv_buffer_size: Option<u32>,

    /// Largest request body accepted, in bytes.
    pub max_message_size: usize,

    /// Maximum concurrent incoming connections.
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:12010".to_string(),
            controller_address: "127.0.0.1:12011".to_string(),
            recv_buffer_size: None,
            max_message_size: 64 * 1024 * 1024,
            max_connections: 1024,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log format: "pretty" or "json".
    pub log_format: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: RuntimeConfig = toml::from_str("").unwrap();
        assert_eq!(config.client.timeouts.connect_ms, -1);
        assert_eq!(config.client.retries.connect_attempts, 10);
        assert_eq!(config.server.bind_address, "127.0.0.1:12010");
    }

    #[test]
    fn test_partial_sections() {
        let config: RuntimeConfig = toml::from_str(
            r#"
            [client.timeouts]
            idle_ms = 250

            [client.transport]
            send_buffer_size = 50000
            "#,
        )
        .unwrap();
        assert_eq!(config.client.timeouts.idle_ms, 250);
        assert_eq!(config.client.timeouts.invocation_ms, -1);
        assert_eq!(config.client.transport.send_buffer_size, Some(50_000));

        let policy = config.client.timeouts.to_policy().unwrap();
        assert_eq!(policy.idle, Timeout::millis(250));
        assert!(policy.connect.is_infinite());
    }
}
