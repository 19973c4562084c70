//! TUN device locators
//!
//! A locator is a URL naming how to obtain the device:
//!
//! - `dev://tun0`: attach to (or create) the interface `tun0`. An empty
//!   host (`dev://`) lets the OS choose the name.
//! - `dev://tun0?mtu=1400`: same, with an authoritative MTU override.
//! - `fd://5`: adopt an already-open TUN descriptor inherited from the
//!   parent process (Android `VpnService`, systemd, ...).

use std::fmt;
use std::os::fd::RawFd;
use std::str::FromStr;

use url::Url;

use super::error::{DeviceError, DeviceResult};

/// Scheme for opening a device by interface name
pub const SCHEME_DEV: &str = "dev";

/// Scheme for adopting an inherited descriptor
pub const SCHEME_FD: &str = "fd";

/// Where a TUN device comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSource {
    /// Open by interface name; empty means OS-assigned
    Name(String),
    /// Adopt an inherited descriptor
    Fd(RawFd),
}

/// Parsed device locator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLocator {
    source: DeviceSource,
    mtu: Option<u32>,
    url: String,
}

impl DeviceLocator {
    /// Parse a locator URL
    ///
    /// # Errors
    ///
    /// - `UnsupportedLocatorKind` if the scheme is not `dev` or `fd`
    /// - `InvalidLocator` if the URL, descriptor number or `mtu` value is malformed
    pub fn parse(locator: &str) -> DeviceResult<Self> {
        let url = Url::parse(locator)
            .map_err(|e| DeviceError::invalid_locator(locator, e.to_string()))?;

        let host = url.host_str().unwrap_or_default();
        let source = match url.scheme() {
            SCHEME_DEV => DeviceSource::Name(host.to_string()),
            SCHEME_FD => {
                let fd: RawFd = host.parse().map_err(|_| {
                    DeviceError::invalid_locator(locator, format!("`{host}` is not a descriptor number"))
                })?;
                if fd < 0 {
                    return Err(DeviceError::invalid_locator(locator, "negative descriptor"));
                }
                DeviceSource::Fd(fd)
            }
            other => return Err(DeviceError::UnsupportedLocatorKind(other.to_string())),
        };

        let mut mtu = None;
        for (key, value) in url.query_pairs() {
            if key == "mtu" {
                let parsed: u32 = value.parse().map_err(|_| {
                    DeviceError::invalid_locator(locator, format!("invalid mtu `{value}`"))
                })?;
                // zero means "ask the OS"
                mtu = (parsed > 0).then_some(parsed);
            }
        }

        Ok(Self {
            source,
            mtu,
            url: locator.to_string(),
        })
    }

    /// Build a by-name locator programmatically
    pub fn by_name(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            url: format!("{SCHEME_DEV}://{name}"),
            source: DeviceSource::Name(name),
            mtu: None,
        }
    }

    /// Build an inherited-descriptor locator programmatically
    pub fn by_fd(fd: RawFd) -> Self {
        Self {
            url: format!("{SCHEME_FD}://{fd}"),
            source: DeviceSource::Fd(fd),
            mtu: None,
        }
    }

    /// Attach an MTU override
    #[must_use]
    pub fn with_mtu(mut self, mtu: u32) -> Self {
        if mtu > 0 {
            self.mtu = Some(mtu);
            self.url = match self.url.split_once('?') {
                Some((base, _)) => format!("{base}?mtu={mtu}"),
                None => format!("{}?mtu={mtu}", self.url),
            };
        }
        self
    }

    /// Device source
    pub fn source(&self) -> &DeviceSource {
        &self.source
    }

    /// MTU override, if any
    pub fn mtu_override(&self) -> Option<u32> {
        self.mtu
    }

    /// Original locator string
    pub fn as_str(&self) -> &str {
        &self.url
    }
}

impl FromStr for DeviceLocator {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for DeviceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}
