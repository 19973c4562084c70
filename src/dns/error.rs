//! Error types for the DNS interception service
//!
//! # Error Categories
//!
//! - **Configuration errors**: bad listen address, missing resolver
//! - **Registration errors**: the stack rejected an endpoint
//! - **Codec errors**: DNS message encoding/decoding and framing failures
//! - **Network errors**: flow or upstream socket I/O
//! - **Upstream errors**: the forwarding resolver got no usable answer
//!
//! # Example
//!
//! ```
//! use tun_intercept::dns::DnsServiceError;
//!
//! let err = DnsServiceError::timeout("query to 1.1.1.1:53", std::time::Duration::from_secs(3));
//! assert!(err.is_recoverable());
//! assert!(err.to_string().contains("timed out"));
//! ```

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::stack::{StackError, TransportProtocol};

/// Error types for the DNS interception service
///
/// Flow-level failures (read errors, deadlines, decode failures) never leave
/// the flow task; they are logged and counted. Everything returned from
/// [`DnsInterceptService::start`](super::DnsInterceptService::start) is a
/// configuration or registration error.
#[derive(Debug, Error)]
pub enum DnsServiceError {
    /// Listen address is not a valid `host:port`
    #[error("Invalid DNS listen address `{input}`: {reason}")]
    AddressParse {
        /// The rejected input
        input: String,
        /// What was wrong with it
        reason: String,
    },

    /// The stack refused one of the service's endpoints
    ///
    /// Any registration made before the failure has been rolled back.
    #[error("Failed to register {transport} DNS endpoint: {source}")]
    EndpointRegistrationFailed {
        /// Which registration failed
        transport: TransportProtocol,
        /// Stack-level cause
        #[source]
        source: StackError,
    },

    /// `create_dns_server` was called without a resolver
    #[error("Failed to create DNS server on tun: resolver not provided")]
    ResolverNotProvided,

    /// DNS message could not be decoded
    #[error("Failed to parse DNS message: {reason}")]
    ParseError {
        /// Description of what went wrong during parsing
        reason: String,
    },

    /// DNS message could not be encoded or framed
    #[error("Failed to serialize DNS message: {reason}")]
    SerializeError {
        /// Description of what went wrong during serialization
        reason: String,
    },

    /// Flow or socket I/O failed
    #[error("Network error: {reason}")]
    NetworkError {
        /// Description of the network failure
        reason: String,
        /// The underlying I/O error, if available
        #[source]
        source: Option<io::Error>,
    },

    /// An operation exceeded its deadline
    #[error("DNS operation timed out after {timeout:?}: {context}")]
    TimeoutError {
        /// What timed out
        context: String,
        /// The deadline that was exceeded
        timeout: Duration,
    },

    /// Upstream resolver failure
    #[error("Upstream server error ({upstream}): {reason}")]
    UpstreamError {
        /// The upstream server address
        upstream: String,
        /// Description of the failure
        reason: String,
    },
}

impl DnsServiceError {
    /// Create an address-parse error
    pub fn address_parse(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::AddressParse {
            input: input.into(),
            reason: reason.into(),
        }
    }

    /// Create a registration error
    pub fn registration(transport: TransportProtocol, source: StackError) -> Self {
        Self::EndpointRegistrationFailed { transport, source }
    }

    /// Create a parse error
    pub fn parse(reason: impl Into<String>) -> Self {
        Self::ParseError {
            reason: reason.into(),
        }
    }

    /// Create a serialize error
    pub fn serialize(reason: impl Into<String>) -> Self {
        Self::SerializeError {
            reason: reason.into(),
        }
    }

    /// Create a network error without an I/O source
    pub fn network(reason: impl Into<String>) -> Self {
        Self::NetworkError {
            reason: reason.into(),
            source: None,
        }
    }

    /// Create a network error wrapping an I/O error
    pub fn network_io(reason: impl Into<String>, source: io::Error) -> Self {
        Self::NetworkError {
            reason: reason.into(),
            source: Some(source),
        }
    }

    /// Create a timeout error
    pub fn timeout(context: impl Into<String>, timeout: Duration) -> Self {
        Self::TimeoutError {
            context: context.into(),
            timeout,
        }
    }

    /// Create an upstream error
    pub fn upstream(upstream: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UpstreamError {
            upstream: upstream.into(),
            reason: reason.into(),
        }
    }

    /// Whether retrying the same operation might succeed
    ///
    /// Timeouts, network and upstream errors are transient; configuration,
    /// registration and codec errors are not.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::TimeoutError { .. } | Self::NetworkError { .. } | Self::UpstreamError { .. }
        )
    }

    /// Whether this is a timeout
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimeoutError { .. })
    }

    /// Whether the peer simply went away
    #[must_use]
    pub fn is_connection_closed(&self) -> bool {
        match self {
            Self::NetworkError { source: None, .. } => true,
            Self::NetworkError { source: Some(e), .. } => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}

/// Result type for DNS service operations
pub type DnsResult<T> = Result<T, DnsServiceError>;
