//! Error types for tun-intercept
//!
//! Each subsystem has its own error enum; [`TunInterceptError`] wraps them
//! for callers that drive the whole pipeline through
//! [`TunAdapter`](crate::adapter::TunAdapter).

use std::io;

use thiserror::Error;

pub use crate::device::DeviceError;
pub use crate::dns::DnsServiceError;
pub use crate::stack::StackError;

/// Top-level error type for tun-intercept
#[derive(Debug, Error)]
pub enum TunInterceptError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// TUN device errors
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Stack registration errors
    #[error("Stack error: {0}")]
    Stack(#[from] StackError),

    /// DNS service errors
    #[error("DNS error: {0}")]
    Dns(#[from] DnsServiceError),

    /// The adapter has been closed
    #[error("Adapter is closed")]
    Closed,

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TunInterceptError {
    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(e) => e.is_recoverable(),
            Self::Device(e) => e.is_recoverable(),
            Self::Stack(e) => e.is_recoverable(),
            Self::Dns(e) => e.is_recoverable(),
            Self::Closed => false,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are generally not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Result type for adapter operations
pub type Result<T, E = TunInterceptError> = std::result::Result<T, E>;
