//! Configuration loading and management
//!
//! This module handles loading configuration from files and environment variables.

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Environment override for `device`
pub const ENV_DEVICE: &str = "TUN_INTERCEPT_DEVICE";
/// Environment override for `dns.listen`
pub const ENV_DNS_LISTEN: &str = "TUN_INTERCEPT_DNS_LISTEN";
/// Environment override for `log.level`
pub const ENV_LOG_LEVEL: &str = "TUN_INTERCEPT_LOG_LEVEL";

/// Load configuration from a JSON file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read or parsed.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: Config = serde_json::from_str(&contents).map_err(|e| {
        ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}"))
    })?;

    config.validate()?;

    info!(
        "Configuration loaded: device={}, dns={}, {} upstreams",
        config.device,
        config.dns.listen,
        config.upstream.servers.len()
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Apply overrides from `lookup` (normally the process environment)
///
/// # Errors
///
/// Returns `ConfigError` if the result no longer validates.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(device) = lookup(ENV_DEVICE) {
        if device.trim().is_empty() {
            return Err(ConfigError::EnvError {
                name: ENV_DEVICE.into(),
                reason: "device locator cannot be empty".into(),
            });
        }
        config.device = device;
        debug!("Device overridden to {}", config.device);
    }

    if let Some(listen) = lookup(ENV_DNS_LISTEN) {
        crate::dns::parse_listen(&listen).map_err(|e| ConfigError::EnvError {
            name: ENV_DNS_LISTEN.into(),
            reason: e.to_string(),
        })?;
        config.dns.listen = listen;
        debug!("DNS listen overridden to {:?}", config.dns.listen);
    }

    if let Some(level) = lookup(ENV_LOG_LEVEL) {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    // Re-validate after overrides
    config.validate()
}

/// Load configuration with environment variable overrides
///
/// Environment variables:
/// - `TUN_INTERCEPT_DEVICE`: Override device locator
/// - `TUN_INTERCEPT_DNS_LISTEN`: Override DNS listen address
/// - `TUN_INTERCEPT_LOG_LEVEL`: Override log level
///
/// # Errors
///
/// Returns `ConfigError` if loading or parsing fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
    Ok(config)
}

/// Create a default configuration file at the given path
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let config = Config::default_config();
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {e}")))?;

    std::fs::write(path, json)?;
    Ok(())
}
