//! Error types for the TUN device layer

use std::io;

use thiserror::Error;

/// Errors raised while opening, configuring or using a TUN device
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Locator scheme is neither `dev` nor `fd`
    #[error("Unsupported device locator scheme `{0}`")]
    UnsupportedLocatorKind(String),

    /// Locator could not be parsed (bad URL, fd number or `mtu` parameter)
    #[error("Invalid device locator `{locator}`: {reason}")]
    InvalidLocator { locator: String, reason: String },

    /// The OS device-control path could not be opened
    #[error("TUN device unavailable ({path}): {source}")]
    DeviceUnavailable {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Requested interface name does not fit the OS interface-name field
    #[error("Interface name `{name}` too long (max {max} bytes)")]
    InterfaceNameTooLong { name: String, max: usize },

    /// Inherited descriptor is not a TUN descriptor in no-packet-info mode
    #[error("Descriptor {fd} is not a TUN device in no-packet-info mode")]
    NotATunnelDescriptor { fd: i32 },

    /// A device-control call failed
    #[error("{request} failed: {source}")]
    Ioctl {
        request: &'static str,
        #[source]
        source: io::Error,
    },

    /// MTU could not be determined and no override was supplied
    #[error("Unable to determine MTU of {name}: {source}")]
    MtuUnavailable {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Device has already been closed
    #[error("TUN device is closed")]
    Closed,

    /// I/O error not covered above
    #[error("TUN I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DeviceError {
    /// Create an ioctl error from the last OS error
    pub(crate) fn last_os_error(request: &'static str) -> Self {
        Self::Ioctl {
            request,
            source: io::Error::last_os_error(),
        }
    }

    /// Create an invalid-locator error
    pub(crate) fn invalid_locator(locator: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidLocator {
            locator: locator.into(),
            reason: reason.into(),
        }
    }

    /// Device errors are never retried automatically; only transient I/O
    /// conditions are reported as recoverable.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

/// Result type for device operations
pub type DeviceResult<T> = Result<T, DeviceError>;
