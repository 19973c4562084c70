//! Fallback for platforms without a TUN backend; every open fails

use std::io;
use std::os::fd::RawFd;

use super::error::{DeviceError, DeviceResult};
use super::fd::TunFd;

pub const IFNAMSIZ: usize = 16;

#[cfg_attr(not(test), allow(dead_code))]
pub(crate) const FRAME_HEADER_LEN: usize = 0;

fn unsupported() -> io::Error {
    io::Error::new(io::ErrorKind::Unsupported, "no TUN support on this platform")
}

pub(crate) fn open_by_name(_name: &str, _mtu: Option<u32>) -> DeviceResult<(TunFd, String)> {
    Err(DeviceError::DeviceUnavailable {
        path: std::env::consts::OS.to_string(),
        source: unsupported(),
    })
}

pub(crate) fn adopt_fd(fd: RawFd) -> DeviceResult<(TunFd, String)> {
    Err(DeviceError::NotATunnelDescriptor { fd })
}

pub(crate) fn query_mtu(_name: &str) -> io::Result<u32> {
    Err(unsupported())
}

pub(crate) fn read_packet(fd: &TunFd, buf: &mut [u8]) -> io::Result<usize> {
    fd.read(buf)
}

pub(crate) fn write_packet(fd: &TunFd, packet: &[u8]) -> io::Result<usize> {
    fd.write(packet)
}
