//! Linux / Android TUN backend (`/dev/net/tun`)

use std::ffi::CStr;
use std::io;
use std::os::fd::{AsRawFd, RawFd};

use tracing::debug;

use super::error::{DeviceError, DeviceResult};
use super::fd::{control_socket, decode_ifname, dup_cloexec, encode_ifname, TunFd};

/// Size of the kernel interface-name field, including the NUL terminator
pub const IFNAMSIZ: usize = 16;

/// Raw IP packets, no framing header
#[cfg_attr(not(test), allow(dead_code))]
pub(crate) const FRAME_HEADER_LEN: usize = 0;

const CLONE_DEVICE: &CStr = c"/dev/net/tun";

// _IOW('T', 202, int) / _IOR('T', 210, unsigned int)
const TUNSETIFF: u32 = 0x4004_54ca;
const TUNGETIFF: u32 = 0x8004_54d2;
const SIOCGIFMTU: u32 = 0x8921;

const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

/// `struct ifreq` viewed through `ifr_flags`
#[repr(C)]
struct IfReqFlags {
    ifr_name: [libc::c_char; IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

/// `struct ifreq` viewed through `ifr_mtu`
#[repr(C)]
struct IfReqMtu {
    ifr_name: [libc::c_char; IFNAMSIZ],
    ifr_mtu: libc::c_int,
    _pad: [u8; 20],
}

impl IfReqFlags {
    fn zeroed() -> Self {
        Self {
            ifr_name: [0; IFNAMSIZ],
            ifr_flags: 0,
            _pad: [0; 22],
        }
    }
}

/// Attach to (or create) `name`; an empty name lets the kernel pick `tunN`
///
/// Returns the non-blocking descriptor and the name the kernel assigned.
pub(crate) fn open_by_name(name: &str, _mtu: Option<u32>) -> DeviceResult<(TunFd, String)> {
    let ifr_name = encode_ifname::<IFNAMSIZ>(name).ok_or_else(|| DeviceError::InterfaceNameTooLong {
        name: name.to_string(),
        max: IFNAMSIZ - 1,
    })?;

    // SAFETY: CLONE_DEVICE is a valid NUL-terminated path
    let raw = unsafe { libc::open(CLONE_DEVICE.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) };
    if raw < 0 {
        return Err(DeviceError::DeviceUnavailable {
            path: CLONE_DEVICE.to_string_lossy().into_owned(),
            source: io::Error::last_os_error(),
        });
    }
    // SAFETY: raw was just returned by open(2)
    let fd = unsafe { TunFd::from_raw(raw) };

    let mut req = IfReqFlags::zeroed();
    req.ifr_name = ifr_name;
    req.ifr_flags = IFF_TUN | IFF_NO_PI;
    // SAFETY: req is a properly sized ifreq for TUNSETIFF
    if unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETIFF as _, &mut req) } < 0 {
        return Err(DeviceError::last_os_error("TUNSETIFF"));
    }

    fd.set_nonblocking()?;

    let (assigned, _) = query_flags(&fd).map_err(|source| DeviceError::Ioctl {
        request: "TUNGETIFF",
        source,
    })?;
    debug!(requested = %name, assigned = %assigned, "Attached TUN interface");
    Ok((fd, assigned))
}

/// Adopt an inherited descriptor
///
/// The descriptor is duplicated first; if the duplicate is not a TUN
/// descriptor in `IFF_TUN | IFF_NO_PI` mode it is closed before returning.
pub(crate) fn adopt_fd(fd: RawFd) -> DeviceResult<(TunFd, String)> {
    let dup = dup_cloexec(fd).map_err(|source| DeviceError::Ioctl {
        request: "F_DUPFD_CLOEXEC",
        source,
    })?;

    let (name, flags) = match query_flags(&dup) {
        Ok(v) => v,
        Err(e) => {
            debug!(fd, error = %e, "TUNGETIFF rejected inherited descriptor");
            return Err(DeviceError::NotATunnelDescriptor { fd });
        }
    };
    if flags & IFF_TUN == 0 || flags & IFF_NO_PI == 0 {
        debug!(fd, flags, "Inherited descriptor has wrong TUN mode");
        return Err(DeviceError::NotATunnelDescriptor { fd });
    }

    dup.set_nonblocking()?;
    Ok((dup, name))
}

fn query_flags(fd: &TunFd) -> io::Result<(String, libc::c_short)> {
    let mut req = IfReqFlags::zeroed();
    // SAFETY: req is a properly sized ifreq for TUNGETIFF
    if unsafe { libc::ioctl(fd.as_raw_fd(), TUNGETIFF as _, &mut req) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((decode_ifname(&req.ifr_name), req.ifr_flags))
}

/// `SIOCGIFMTU` on a short-lived control socket
pub(crate) fn query_mtu(name: &str) -> io::Result<u32> {
    let ifr_name = encode_ifname::<IFNAMSIZ>(name)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "interface name too long"))?;
    let sock = control_socket()?;

    let mut req = IfReqMtu {
        ifr_name,
        ifr_mtu: 0,
        _pad: [0; 20],
    };
    // SAFETY: req is a properly sized ifreq for SIOCGIFMTU
    if unsafe { libc::ioctl(sock.as_raw_fd(), SIOCGIFMTU as _, &mut req) } < 0 {
        return Err(io::Error::last_os_error());
    }
    u32::try_from(req.ifr_mtu).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "negative MTU"))
}

/// Read one packet
pub(crate) fn read_packet(fd: &TunFd, buf: &mut [u8]) -> io::Result<usize> {
    fd.read(buf)
}

/// Write one packet
pub(crate) fn write_packet(fd: &TunFd, packet: &[u8]) -> io::Result<usize> {
    fd.write(packet)
}
