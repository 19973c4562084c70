//! macOS utun backend (`PF_SYSTEM` kernel control socket)
//!
//! utun frames every packet with a 4-byte address-family header in network
//! byte order. [`read_packet`] and [`write_packet`] strip and add it so the
//! rest of the crate only ever sees raw IP.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, RawFd};

use tracing::debug;

use super::error::{DeviceError, DeviceResult};
use super::fd::{control_socket, decode_ifname, dup_cloexec, encode_ifname, TunFd};

/// Size of the kernel interface-name field, including the NUL terminator
pub const IFNAMSIZ: usize = 16;

/// Address-family header in front of every packet
pub(crate) const FRAME_HEADER_LEN: usize = 4;

const UTUN_CONTROL_NAME: &[u8] = b"com.apple.net.utun_control";
const UTUN_PREFIX: &str = "utun";
const UTUN_OPT_IFNAME: libc::c_int = 2;
const SYSPROTO_CONTROL: libc::c_int = 2;
const AF_SYS_CONTROL: u16 = 2;
const MAX_KCTL_NAME: usize = 96;

// _IOWR('N', 3, struct ctl_info)
const CTLIOCGINFO: libc::c_ulong = 0xc064_4e03;
// _IOWR('i', 51, struct ifreq) / _IOW('i', 52, struct ifreq)
const SIOCGIFMTU: libc::c_ulong = 0xc020_6933;
const SIOCSIFMTU: libc::c_ulong = 0x8020_6934;

#[repr(C)]
struct CtlInfo {
    ctl_id: u32,
    ctl_name: [libc::c_char; MAX_KCTL_NAME],
}

#[repr(C)]
struct SockaddrCtl {
    sc_len: u8,
    sc_family: u8,
    ss_sysaddr: u16,
    sc_id: u32,
    sc_unit: u32,
    sc_reserved: [u32; 5],
}

/// `struct ifreq` viewed through `ifr_mtu`
#[repr(C)]
struct IfReqMtu {
    ifr_name: [libc::c_char; IFNAMSIZ],
    ifr_mtu: libc::c_int,
    _pad: [u8; 12],
}

/// Parse `utun` / `utunN` into a `sc_unit` value (`N + 1`, `0` = kernel choice)
fn control_unit(name: &str) -> Result<u32, String> {
    if name.is_empty() {
        return Ok(0);
    }
    let Some(index) = name.strip_prefix(UTUN_PREFIX) else {
        return Err(format!("interface name must be utun[0-9]*, got `{name}`"));
    };
    if index.is_empty() {
        return Ok(0);
    }
    index
        .parse::<u32>()
        .ok()
        .and_then(|n| n.checked_add(1))
        .ok_or_else(|| format!("interface name must be utun[0-9]*, got `{name}`"))
}

/// Open a utun interface by name; `""` or `utun` lets the kernel pick
pub(crate) fn open_by_name(name: &str, mtu: Option<u32>) -> DeviceResult<(TunFd, String)> {
    if name.len() >= IFNAMSIZ {
        return Err(DeviceError::InterfaceNameTooLong {
            name: name.to_string(),
            max: IFNAMSIZ - 1,
        });
    }
    let unit = control_unit(name).map_err(|reason| DeviceError::invalid_locator(format!("dev://{name}"), reason))?;

    // SAFETY: plain socket(2) call
    let raw = unsafe { libc::socket(libc::PF_SYSTEM, libc::SOCK_DGRAM, SYSPROTO_CONTROL) };
    if raw < 0 {
        return Err(DeviceError::DeviceUnavailable {
            path: "PF_SYSTEM".to_string(),
            source: io::Error::last_os_error(),
        });
    }
    // SAFETY: raw was just returned by socket(2)
    let fd = unsafe { TunFd::from_raw(raw) };

    let mut info = CtlInfo {
        ctl_id: 0,
        ctl_name: [0; MAX_KCTL_NAME],
    };
    for (dst, src) in info.ctl_name.iter_mut().zip(UTUN_CONTROL_NAME) {
        *dst = *src as libc::c_char;
    }
    // SAFETY: info is a properly sized ctl_info
    if unsafe { libc::ioctl(fd.as_raw_fd(), CTLIOCGINFO, &mut info) } < 0 {
        return Err(DeviceError::last_os_error("CTLIOCGINFO"));
    }

    let addr = SockaddrCtl {
        sc_len: mem::size_of::<SockaddrCtl>() as u8,
        sc_family: libc::AF_SYSTEM as u8,
        ss_sysaddr: AF_SYS_CONTROL,
        sc_id: info.ctl_id,
        sc_unit: unit,
        sc_reserved: [0; 5],
    };
    // SAFETY: addr is a valid sockaddr_ctl and its size is passed alongside
    let r = unsafe {
        libc::connect(
            fd.as_raw_fd(),
            (&addr as *const SockaddrCtl).cast(),
            mem::size_of::<SockaddrCtl>() as libc::socklen_t,
        )
    };
    if r < 0 {
        return Err(DeviceError::last_os_error("connect(utun_control)"));
    }

    // SAFETY: FD_CLOEXEC on our own descriptor
    unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) };
    fd.set_nonblocking()?;

    let assigned = interface_name(&fd).map_err(|source| DeviceError::Ioctl {
        request: "UTUN_OPT_IFNAME",
        source,
    })?;

    if let Some(mtu) = mtu {
        set_mtu(&assigned, mtu).map_err(|source| DeviceError::Ioctl {
            request: "SIOCSIFMTU",
            source,
        })?;
    }

    debug!(requested = %name, assigned = %assigned, "Attached utun interface");
    Ok((fd, assigned))
}

/// Adopt an inherited utun descriptor
///
/// The duplicate is closed if `UTUN_OPT_IFNAME` fails on it.
pub(crate) fn adopt_fd(fd: RawFd) -> DeviceResult<(TunFd, String)> {
    let dup = dup_cloexec(fd).map_err(|source| DeviceError::Ioctl {
        request: "F_DUPFD_CLOEXEC",
        source,
    })?;

    let name = match interface_name(&dup) {
        Ok(name) if name.starts_with(UTUN_PREFIX) => name,
        Ok(name) => {
            debug!(fd, name = %name, "Inherited descriptor is not a utun interface");
            return Err(DeviceError::NotATunnelDescriptor { fd });
        }
        Err(e) => {
            debug!(fd, error = %e, "UTUN_OPT_IFNAME rejected inherited descriptor");
            return Err(DeviceError::NotATunnelDescriptor { fd });
        }
    };

    dup.set_nonblocking()?;
    Ok((dup, name))
}

fn interface_name(fd: &TunFd) -> io::Result<String> {
    let mut buf = [0 as libc::c_char; IFNAMSIZ];
    let mut len = IFNAMSIZ as libc::socklen_t;
    // SAFETY: buf has len bytes of writable storage
    let r = unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            SYSPROTO_CONTROL,
            UTUN_OPT_IFNAME,
            buf.as_mut_ptr().cast(),
            &mut len,
        )
    };
    if r < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(decode_ifname(&buf))
}

fn mtu_request(name: &str, mtu: libc::c_int) -> io::Result<IfReqMtu> {
    let ifr_name = encode_ifname::<IFNAMSIZ>(name)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "interface name too long"))?;
    Ok(IfReqMtu {
        ifr_name,
        ifr_mtu: mtu,
        _pad: [0; 12],
    })
}

fn set_mtu(name: &str, mtu: u32) -> io::Result<()> {
    let mtu = libc::c_int::try_from(mtu).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "MTU out of range"))?;
    let mut req = mtu_request(name, mtu)?;
    let sock = control_socket()?;
    // SAFETY: req is a properly sized ifreq for SIOCSIFMTU
    if unsafe { libc::ioctl(sock.as_raw_fd(), SIOCSIFMTU, &mut req) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// `SIOCGIFMTU` on a short-lived control socket
pub(crate) fn query_mtu(name: &str) -> io::Result<u32> {
    let mut req = mtu_request(name, 0)?;
    let sock = control_socket()?;
    // SAFETY: req is a properly sized ifreq for SIOCGIFMTU
    if unsafe { libc::ioctl(sock.as_raw_fd(), SIOCGIFMTU, &mut req) } < 0 {
        return Err(io::Error::last_os_error());
    }
    u32::try_from(req.ifr_mtu).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "negative MTU"))
}

/// Address family of a raw IP packet, in utun header form
fn family_header(packet: &[u8]) -> io::Result<[u8; FRAME_HEADER_LEN]> {
    let family = match packet.first().map(|b| b >> 4) {
        Some(4) => libc::AF_INET,
        Some(6) => libc::AF_INET6,
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not an IPv4 or IPv6 packet",
            ))
        }
    };
    Ok((family as u32).to_be_bytes())
}

/// Read one packet, dropping the utun header
pub(crate) fn read_packet(fd: &TunFd, buf: &mut [u8]) -> io::Result<usize> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    let iov = [
        libc::iovec {
            iov_base: header.as_mut_ptr().cast(),
            iov_len: header.len(),
        },
        libc::iovec {
            iov_base: buf.as_mut_ptr().cast(),
            iov_len: buf.len(),
        },
    ];
    // SAFETY: both iovecs point at live, writable buffers of the stated length
    let n = unsafe { libc::readv(fd.as_raw_fd(), iov.as_ptr(), iov.len() as libc::c_int) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((n as usize).saturating_sub(FRAME_HEADER_LEN))
}

/// Write one packet, prepending the utun header
pub(crate) fn write_packet(fd: &TunFd, packet: &[u8]) -> io::Result<usize> {
    let header = family_header(packet)?;
    let iov = [
        libc::iovec {
            iov_base: header.as_ptr() as *mut libc::c_void,
            iov_len: header.len(),
        },
        libc::iovec {
            iov_base: packet.as_ptr() as *mut libc::c_void,
            iov_len: packet.len(),
        },
    ];
    // SAFETY: both iovecs point at live buffers; writev does not mutate them
    let n = unsafe { libc::writev(fd.as_raw_fd(), iov.as_ptr(), iov.len() as libc::c_int) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((n as usize).saturating_sub(FRAME_HEADER_LEN))
}
