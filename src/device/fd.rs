//! Owned TUN descriptor and the small libc helpers shared by every platform

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

/// Exclusively owned TUN descriptor
///
/// Dropping it closes the descriptor exactly once (`OwnedFd` semantics).
#[derive(Debug)]
pub struct TunFd {
    fd: OwnedFd,
}

impl TunFd {
    /// Take ownership of a raw descriptor
    ///
    /// # Safety
    ///
    /// `fd` must be open and not owned by anything else.
    pub(crate) unsafe fn from_raw(fd: RawFd) -> Self {
        Self {
            fd: OwnedFd::from_raw_fd(fd),
        }
    }

    /// Switch the descriptor to non-blocking mode
    pub(crate) fn set_nonblocking(&self) -> io::Result<()> {
        let raw = self.fd.as_raw_fd();
        // SAFETY: raw is a valid descriptor owned by self
        let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if flags & libc::O_NONBLOCK != 0 {
            return Ok(());
        }
        // SAFETY: raw is valid; flags came from F_GETFL
        let r = unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if r < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Whether `O_NONBLOCK` is set
    #[cfg(test)]
    pub(crate) fn is_nonblocking(&self) -> io::Result<bool> {
        // SAFETY: descriptor owned by self
        let flags = unsafe { libc::fcntl(self.fd.as_raw_fd(), libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(flags & libc::O_NONBLOCK != 0)
    }

    /// Single `read(2)`
    pub(crate) fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: buf is valid for buf.len() bytes of writes
        let n = unsafe { libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Single `write(2)`
    pub(crate) fn write(&self, buf: &[u8]) -> io::Result<usize> {
        // SAFETY: buf is valid for buf.len() bytes of reads
        let n = unsafe { libc::write(self.fd.as_raw_fd(), buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl From<OwnedFd> for TunFd {
    fn from(fd: OwnedFd) -> Self {
        Self { fd }
    }
}

impl AsRawFd for TunFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for TunFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Duplicate a descriptor the caller keeps owning (close-on-exec set)
pub(crate) fn dup_cloexec(fd: RawFd) -> io::Result<TunFd> {
    // SAFETY: F_DUPFD_CLOEXEC does not touch memory; an invalid fd yields EBADF
    let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
    if dup < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: dup is a fresh descriptor nobody else owns
    Ok(unsafe { TunFd::from_raw(dup) })
}

/// Short-lived `AF_UNIX`/`SOCK_DGRAM` socket used for interface ioctls
pub(crate) fn control_socket() -> io::Result<OwnedFd> {
    // SAFETY: plain socket(2) call
    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd is a fresh descriptor
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Copy `name` into a fixed-size, NUL-terminated interface-name field
///
/// Returns `None` if the name (plus terminator) does not fit.
pub(crate) fn encode_ifname<const N: usize>(name: &str) -> Option<[libc::c_char; N]> {
    let bytes = name.as_bytes();
    if bytes.len() >= N || bytes.contains(&0) {
        return None;
    }
    let mut out = [0 as libc::c_char; N];
    for (dst, src) in out.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    Some(out)
}

/// Read a NUL-terminated interface name out of a fixed-size field
pub(crate) fn decode_ifname(raw: &[libc::c_char]) -> String {
    let bytes: Vec<u8> = raw
        .iter()
        .take_while(|c| **c != 0)
        .map(|c| *c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}
