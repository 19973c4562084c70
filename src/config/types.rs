//! Configuration types for tun-intercept
//!
//! Configuration is loaded from JSON files and validated at startup.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dns::{parse_listen, DnsServiceConfig, DEFAULT_READ_TIMEOUT, MAX_TCP_MESSAGE_SIZE, MIN_DNS_MESSAGE_SIZE};
use crate::error::ConfigError;
use crate::stack::{StackConfig, DEFAULT_CHANNEL_SIZE};

/// Known log levels
pub const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Device locator (`dev://name[?mtu=N]` or `fd://N`)
    pub device: String,

    /// In-stack DNS responder
    #[serde(default)]
    pub dns: DnsConfig,

    /// Servers the built-in forwarder relays to
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Stack tuning
    #[serde(default)]
    pub stack: StackSettings,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.trim().is_empty() {
            return Err(ConfigError::ValidationError("device cannot be empty".into()));
        }

        self.dns.validate()?;
        self.stack.validate()?;
        self.log.validate()?;

        if self.dns.is_enabled()? {
            self.upstream.validate()?;
        }

        Ok(())
    }

    /// Create a minimal default configuration
    #[must_use]
    pub fn default_config() -> Self {
        Self {
            device: "dev://tun0?mtu=1500".into(),
            dns: DnsConfig::default(),
            upstream: UpstreamConfig::default(),
            stack: StackSettings::default(),
            log: LogConfig::default(),
        }
    }
}

/// DNS responder configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DnsConfig {
    /// `host:port`; port 0 or empty disables the responder
    #[serde(default = "default_dns_listen")]
    pub listen: String,

    /// Idle deadline per flow, in seconds
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,

    /// Largest TCP frame accepted
    #[serde(default = "default_max_tcp_message_size")]
    pub max_tcp_message_size: usize,
}

impl DnsConfig {
    /// Validate DNS settings
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        parse_listen(&self.listen).map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        if self.read_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "dns.read_timeout_secs must be greater than 0".into(),
            ));
        }

        if !(MIN_DNS_MESSAGE_SIZE..=MAX_TCP_MESSAGE_SIZE).contains(&self.max_tcp_message_size) {
            return Err(ConfigError::ValidationError(format!(
                "dns.max_tcp_message_size must be between {MIN_DNS_MESSAGE_SIZE} and {MAX_TCP_MESSAGE_SIZE}"
            )));
        }

        Ok(())
    }

    /// Whether `listen` enables the responder
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for a malformed address.
    pub fn is_enabled(&self) -> Result<bool, ConfigError> {
        parse_listen(&self.listen)
            .map(|addr| addr.is_some())
            .map_err(|e| ConfigError::ValidationError(e.to_string()))
    }

    /// Get the read timeout as Duration
    #[must_use]
    pub const fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Service settings derived from this section
    #[must_use]
    pub fn service_config(&self) -> DnsServiceConfig {
        DnsServiceConfig {
            read_timeout: self.read_timeout(),
            max_tcp_message_size: self.max_tcp_message_size,
        }
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            listen: default_dns_listen(),
            read_timeout_secs: default_read_timeout_secs(),
            max_tcp_message_size: default_max_tcp_message_size(),
        }
    }
}

/// Upstream forwarder configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// Servers tried in order
    #[serde(default = "default_upstream_servers")]
    pub servers: Vec<SocketAddr>,

    /// Per-server timeout in milliseconds
    #[serde(default = "default_upstream_timeout_ms")]
    pub timeout_ms: u64,
}

impl UpstreamConfig {
    /// Validate upstream settings
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::ValidationError(
                "At least one upstream server must be configured when DNS is enabled".into(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "upstream.timeout_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Get the per-server timeout as Duration
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            servers: default_upstream_servers(),
            timeout_ms: default_upstream_timeout_ms(),
        }
    }
}

/// Stack tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StackSettings {
    /// Unclaimed-flow channel and listener backlog capacity
    #[serde(default = "default_channel_size")]
    pub channel_size: usize,
}

impl StackSettings {
    /// Validate stack settings
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel_size == 0 {
            return Err(ConfigError::ValidationError(
                "stack.channel_size must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn stack_config(&self) -> StackConfig {
        StackConfig {
            channel_size: self.channel_size,
        }
    }
}

impl Default for StackSettings {
    fn default() -> Self {
        Self {
            channel_size: default_channel_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include target (module path)
    #[serde(default)]
    pub target: bool,
}

impl LogConfig {
    /// Validate logging settings
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for an unknown level or format.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !LOG_LEVELS.contains(&self.level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Unknown log level '{}' (expected one of {})",
                self.level,
                LOG_LEVELS.join(", ")
            )));
        }
        if self.format != "json" && self.format != "text" {
            return Err(ConfigError::ValidationError(format!(
                "Unknown log format '{}' (expected json or text)",
                self.format
            )));
        }
        Ok(())
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: false,
        }
    }
}

fn default_dns_listen() -> String {
    "198.18.0.2:53".into()
}

const fn default_read_timeout_secs() -> u64 {
    DEFAULT_READ_TIMEOUT.as_secs()
}

const fn default_max_tcp_message_size() -> usize {
    MAX_TCP_MESSAGE_SIZE
}

fn default_upstream_servers() -> Vec<SocketAddr> {
    vec![SocketAddr::from(([1, 1, 1, 1], 53))]
}

const fn default_upstream_timeout_ms() -> u64 {
    3000
}

const fn default_channel_size() -> usize {
    DEFAULT_CHANNEL_SIZE
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}
