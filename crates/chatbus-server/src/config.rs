//! Server configuration.
//!
//! Configuration is layered, later sources overriding earlier ones:
//! - Built-in defaults
//! - TOML configuration file (first of `chatbus.toml`, `/etc/chatbus/chatbus.toml`,
//!   `~/.config/chatbus/chatbus.toml`)
//! - Environment variables (`CHATBUS_*`, nested keys joined with `__`, e.g.
//!   `CHATBUS_LIMITS__MAX_MESSAGES=100`)

use anyhow::{ensure, Context, Result};
use chatbus_core::{BrokerConfig, LivenessConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_PATHS: [&str; 3] = [
    "chatbus.toml",
    "/etc/chatbus/chatbus.toml",
    "~/.config/chatbus/chatbus.toml",
];

const ENV_PREFIX: &str = "CHATBUS";

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Validation and queue limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Validation and queue limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Messages retained per channel.
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,

    /// Messages replayed to a new subscriber.
    #[serde(default = "default_history_replay")]
    pub history_replay: usize,

    /// Maximum channel name length in characters.
    #[serde(default = "default_max_channel_name_length")]
    pub max_channel_name_length: usize,

    /// Maximum username length in characters.
    #[serde(default = "default_max_username_length")]
    pub max_username_length: usize,

    /// Maximum message text length in characters.
    #[serde(default = "default_max_text_length")]
    pub max_text_length: usize,

    /// Outbound frames buffered per connection before it is disconnected.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Probe interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Per-connection probe timeout in milliseconds.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3001
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_messages() -> usize {
    50
}

fn default_history_replay() -> usize {
    20
}

fn default_max_channel_name_length() -> usize {
    100
}

fn default_max_username_length() -> usize {
    50
}

fn default_max_text_length() -> usize {
    1000
}

fn default_outbound_queue() -> usize {
    256
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_probe_timeout() -> u64 {
    5_000
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
            history_replay: default_history_replay(),
            max_channel_name_length: default_max_channel_name_length(),
            max_username_length: default_max_username_length(),
            max_text_length: default_max_text_length(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            probe_timeout_ms: default_probe_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, with
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file or variable cannot be parsed.
    pub fn load() -> Result<Self> {
        let file = CONFIG_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists());

        if let Some(path) = &file {
            tracing::info!("Loading configuration from {}", path.display());
        }

        Self::layered(file.as_deref(), Self::environment())
    }

    fn environment() -> config::Environment {
        config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    fn layered(file: Option<&Path>, env: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Toml));
        }

        let config: Config = builder
            .add_source(env)
            .build()
            .context("Failed to assemble configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Check values that deserialize fine but cannot be run with.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first offending key.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.heartbeat.interval_ms > 0,
            "heartbeat.interval_ms must be greater than zero"
        );
        ensure!(
            self.heartbeat.probe_timeout_ms > 0,
            "heartbeat.probe_timeout_ms must be greater than zero"
        );
        ensure!(
            self.limits.outbound_queue > 0,
            "limits.outbound_queue must be greater than zero"
        );
        ensure!(
            self.limits.max_messages > 0,
            "limits.max_messages must be greater than zero"
        );
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Broker settings derived from the limits.
    #[must_use]
    pub fn broker(&self) -> BrokerConfig {
        BrokerConfig {
            max_messages: self.limits.max_messages,
            history_replay: self.limits.history_replay,
            max_channel_name_length: self.limits.max_channel_name_length,
            max_username_length: self.limits.max_username_length,
            max_text_length: self.limits.max_text_length,
            outbound_queue: self.limits.outbound_queue,
        }
    }

    /// Liveness settings derived from the heartbeat section.
    #[must_use]
    pub fn liveness(&self) -> LivenessConfig {
        LivenessConfig {
            interval: Duration::from_millis(self.heartbeat.interval_ms),
            probe_timeout: Duration::from_millis(self.heartbeat.probe_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> config::Environment {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::environment().source(Some(vars))
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 3001);
        assert_eq!(config.transport.websocket_path, "/ws");
        assert_eq!(config.limits.max_messages, 50);
        assert_eq!(config.heartbeat.interval_ms, 30_000);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 3001);

        let bad = Config {
            host: "not an address".into(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [limits]
            max_messages = 200
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.limits.max_messages, 200);
        assert_eq!(config.limits.history_replay, 20);
        assert!(config.metrics.enabled);
    }

    #[test]
    fn test_layered_defaults() {
        let config = Config::layered(None, env(&[])).unwrap();
        assert_eq!(config.port, 3001);
        assert_eq!(config.limits.outbound_queue, 256);
    }

    #[test]
    fn test_environment_overrides() {
        let config = Config::layered(
            None,
            env(&[
                ("CHATBUS_PORT", "4000"),
                ("CHATBUS_LIMITS__MAX_MESSAGES", "75"),
                ("CHATBUS_METRICS__ENABLED", "false"),
            ]),
        )
        .unwrap();

        assert_eq!(config.port, 4000);
        assert_eq!(config.limits.max_messages, 75);
        assert!(!config.metrics.enabled);
        assert_eq!(config.limits.max_text_length, 1000);
    }

    #[test]
    fn test_zero_intervals_rejected() {
        let err = Config::layered(None, env(&[("CHATBUS_HEARTBEAT__INTERVAL_MS", "0")]))
            .unwrap_err();
        assert!(err.to_string().contains("heartbeat.interval_ms"));

        let err = Config::layered(None, env(&[("CHATBUS_HEARTBEAT__PROBE_TIMEOUT_MS", "0")]))
            .unwrap_err();
        assert!(err.to_string().contains("heartbeat.probe_timeout_ms"));

        let err = Config::layered(None, env(&[("CHATBUS_LIMITS__OUTBOUND_QUEUE", "0")]))
            .unwrap_err();
        assert!(err.to_string().contains("limits.outbound_queue"));
    }

    #[test]
    fn test_zero_interval_in_file_rejected() {
        let config: Config = toml::from_str(
            r#"
            [heartbeat]
            interval_ms = 0
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_derived_settings() {
        let config: Config = toml::from_str(
            r#"
            [limits]
            max_text_length = 280

            [heartbeat]
            interval_ms = 1500
            "#,
        )
        .unwrap();

        assert_eq!(config.broker().max_text_length, 280);
        assert_eq!(config.broker().max_messages, 50);
        assert_eq!(config.liveness().interval, Duration::from_millis(1500));
        assert_eq!(config.liveness().probe_timeout, Duration::from_secs(5));
    }
}
