//! Configuration module for tun-intercept
//!
//! This module provides configuration types and loading utilities.
//!
//! # Example
//!
//! ```no_run
//! use tun_intercept::config::{load_config, Config};
//!
//! let config = load_config("/etc/tun-intercept/config.json").unwrap();
//! println!("Device: {}", config.device);
//! ```

mod loader;
mod types;

pub use loader::{
    apply_env_overrides, create_default_config, load_config, load_config_str, load_config_with_env, ENV_DEVICE,
    ENV_DNS_LISTEN, ENV_LOG_LEVEL,
};
pub use types::{Config, DnsConfig, LogConfig, StackSettings, UpstreamConfig, LOG_LEVELS};
