//! TUN device handle
//!
//! [`TunDevice`] owns one non-blocking TUN descriptor, opened either by
//! interface name (`dev://tun0`) or adopted from a parent process
//! (`fd://5`). The per-OS details live in `linux` / `macos` and are picked at
//! compile time.
//!
//! # Lifecycle
//!
//! ```text
//! open ──► read/write (sync, non-blocking)
//!   │
//!   └──► as_link_endpoint ──► stack drives the descriptor
//!   │
//!   └──► close (idempotent, releases the descriptor once)
//! ```

mod error;
mod fd;
mod link;
mod locator;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod linux;
#[cfg(any(target_os = "linux", target_os = "android"))]
use linux as sys;

#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "macos")]
use macos as sys;

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
mod unsupported;
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
use unsupported as sys;

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use error::{DeviceError, DeviceResult};
pub use fd::TunFd;
pub use link::LinkEndpoint;
pub use locator::{DeviceLocator, DeviceSource, SCHEME_DEV, SCHEME_FD};
pub use sys::IFNAMSIZ;

/// OS interface queries the device needs
///
/// Split out so the MTU path can be exercised without privileges.
pub trait InterfaceControl: Send + Sync + fmt::Debug {
    /// Current MTU of interface `name`
    fn query_mtu(&self, name: &str) -> io::Result<u32>;
}

/// `SIOCGIFMTU` through a short-lived control socket
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInterfaceControl;

impl InterfaceControl for SystemInterfaceControl {
    fn query_mtu(&self, name: &str) -> io::Result<u32> {
        sys::query_mtu(name)
    }
}

/// An open TUN interface
pub struct TunDevice {
    name: String,
    locator: DeviceLocator,
    control: Arc<dyn InterfaceControl>,
    /// Descriptor before a link endpoint takes it over
    raw: Mutex<Option<TunFd>>,
    /// Cached link endpoint
    link: Mutex<Option<LinkEndpoint>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl TunDevice {
    /// Open a device from a locator string
    ///
    /// # Errors
    ///
    /// See [`DeviceError`]; the locator is parsed first, then the OS device
    /// is opened and switched to non-blocking mode.
    pub fn open(locator: &str) -> DeviceResult<Self> {
        Self::open_with(DeviceLocator::parse(locator)?, Arc::new(SystemInterfaceControl))
    }

    /// Open a device with a custom interface-control implementation
    pub fn open_with(locator: DeviceLocator, control: Arc<dyn InterfaceControl>) -> DeviceResult<Self> {
        let (fd, name) = match locator.source() {
            DeviceSource::Name(requested) => sys::open_by_name(requested, locator.mtu_override())?,
            DeviceSource::Fd(inherited) => sys::adopt_fd(*inherited)?,
        };
        info!(name = %name, url = %locator, "Opened TUN device");
        Ok(Self::from_parts(name, locator, fd, control))
    }

    /// Assemble a handle around an already-open descriptor
    pub(crate) fn from_parts(
        name: String,
        locator: DeviceLocator,
        fd: TunFd,
        control: Arc<dyn InterfaceControl>,
    ) -> Self {
        Self {
            name,
            locator,
            control,
            raw: Mutex::new(Some(fd)),
            link: Mutex::new(None),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Interface name as reported by the OS
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Locator the device was opened with
    pub fn url(&self) -> &str {
        self.locator.as_str()
    }

    /// Device MTU
    ///
    /// A locator `mtu` override wins and no OS query is made. Otherwise the
    /// interface is asked on every call.
    pub fn mtu(&self) -> DeviceResult<u32> {
        if let Some(mtu) = self.locator.mtu_override() {
            return Ok(mtu);
        }
        self.control
            .query_mtu(&self.name)
            .map_err(|source| DeviceError::MtuUnavailable {
                name: self.name.clone(),
                source,
            })
    }

    /// Read one packet without blocking
    ///
    /// Returns `Io(WouldBlock)` when nothing is queued. Once a link endpoint
    /// exists this competes with the stack for packets.
    pub fn read(&self, buf: &mut [u8]) -> DeviceResult<usize> {
        self.ensure_open()?;
        if let Some(fd) = self.raw.lock().as_ref() {
            return Ok(sys::read_packet(fd, buf)?);
        }
        match self.link.lock().as_ref() {
            Some(link) => Ok(link.try_read(buf)?),
            None => Err(DeviceError::Closed),
        }
    }

    /// Write one packet without blocking
    pub fn write(&self, packet: &[u8]) -> DeviceResult<usize> {
        self.ensure_open()?;
        if let Some(fd) = self.raw.lock().as_ref() {
            return Ok(sys::write_packet(fd, packet)?);
        }
        match self.link.lock().as_ref() {
            Some(link) => Ok(link.try_write(packet)?),
            None => Err(DeviceError::Closed),
        }
    }

    /// Link endpoint for the embedded stack
    ///
    /// Built on first call and cached; later calls return clones sharing the
    /// same reactor registration. Must run inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// `Closed` after [`close`](Self::close); `MtuUnavailable` when no
    /// override was given and the OS query fails.
    pub fn as_link_endpoint(&self) -> DeviceResult<LinkEndpoint> {
        let mut cached = self.link.lock();
        self.ensure_open()?;
        if let Some(link) = cached.as_ref() {
            return Ok(link.clone());
        }

        let mtu = self.mtu()?;
        let fd = self.raw.lock().take().ok_or(DeviceError::Closed)?;
        let link = LinkEndpoint::new(fd, self.name.clone(), mtu, self.shutdown.clone())?;
        debug!(name = %self.name, mtu, "Created link endpoint");
        *cached = Some(link.clone());
        Ok(link)
    }

    /// Release the descriptor
    ///
    /// Safe to call any number of times; only the first call does anything.
    /// Pending link reads and writes fail with `BrokenPipe`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        drop(self.raw.lock().take());
        if let Some(link) = self.link.lock().as_ref() {
            link.release();
        }
        info!(name = %self.name, "Closed TUN device");
    }

    /// Whether [`close`](Self::close) has run
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> DeviceResult<()> {
        if self.is_closed() {
            return Err(DeviceError::Closed);
        }
        Ok(())
    }
}

impl Drop for TunDevice {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for TunDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunDevice")
            .field("name", &self.name)
            .field("url", &self.locator.as_str())
            .field("closed", &self.is_closed())
            .finish()
    }
}
