//! Device locators and inherited descriptors
//!
//! Only the `#[ignore]`d test touches a real TUN device.

#![cfg(unix)]

use std::os::fd::AsRawFd;
use std::os::unix::net::UnixDatagram;

use tun_intercept::{AdapterConfig, DeviceError, DeviceLocator, TunAdapter, TunDevice, TunInterceptError};

fn fd_is_open(fd: i32) -> bool {
    // SAFETY: F_GETFD only inspects the descriptor table
    unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
}

/// Descriptors in this process referring to the same open file as `fd`
fn copies_of(fd: i32) -> usize {
    let identity = |fd: i32| {
        // SAFETY: fstat writes into a zeroed stat we own; bad fds just fail
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        (unsafe { libc::fstat(fd, &mut st) } == 0).then_some((st.st_dev, st.st_ino))
    };
    let target = identity(fd).expect("descriptor not open");
    (0..4096).filter(|&other| identity(other) == Some(target)).count()
}

#[test]
fn test_inherited_socket_rejected_and_left_open() {
    let (ours, _peer) = UnixDatagram::pair().unwrap();
    let fd = ours.as_raw_fd();
    assert_eq!(copies_of(fd), 1);

    let err = TunDevice::open(&format!("fd://{fd}")).unwrap_err();
    assert!(matches!(err, DeviceError::NotATunnelDescriptor { fd: reported } if reported == fd));
    assert!(!err.is_recoverable());

    // the caller still owns a working descriptor, the duplicate is gone
    assert!(fd_is_open(fd));
    assert_eq!(copies_of(fd), 1);
    ours.set_nonblocking(true).unwrap();
}

#[test]
fn test_adapter_open_reports_device_error() {
    let (ours, _peer) = UnixDatagram::pair().unwrap();
    let err = TunAdapter::open(&format!("fd://{}", ours.as_raw_fd()), AdapterConfig::default()).unwrap_err();
    assert!(matches!(
        err,
        TunInterceptError::Device(DeviceError::NotATunnelDescriptor { .. })
    ));
    assert!(fd_is_open(ours.as_raw_fd()));
    assert_eq!(copies_of(ours.as_raw_fd()), 1);
}

#[test]
fn test_unsupported_and_malformed_locators() {
    assert!(matches!(
        TunDevice::open("tap://tap0"),
        Err(DeviceError::UnsupportedLocatorKind(scheme)) if scheme == "tap"
    ));
    assert!(matches!(
        TunDevice::open("fd://stdin"),
        Err(DeviceError::InvalidLocator { .. })
    ));
    assert!(matches!(
        TunDevice::open("dev://tun0?mtu=big"),
        Err(DeviceError::InvalidLocator { .. })
    ));
    assert!(matches!(
        TunAdapter::open("not a url", AdapterConfig::default()),
        Err(TunInterceptError::Device(DeviceError::InvalidLocator { .. }))
    ));
}

#[test]
fn test_locator_round_trip_through_builders() {
    let by_name = DeviceLocator::by_name("tun7").with_mtu(1400);
    let parsed = DeviceLocator::parse(by_name.as_str()).unwrap();
    assert_eq!(parsed.mtu_override(), Some(1400));

    let by_fd = DeviceLocator::by_fd(9);
    assert_eq!(DeviceLocator::parse(by_fd.as_str()).unwrap().as_str(), "fd://9");
}

#[tokio::test]
#[ignore = "requires CAP_NET_ADMIN and /dev/net/tun or utun"]
async fn test_open_real_device() {
    let adapter = TunAdapter::open("dev://?mtu=1400", AdapterConfig::default()).unwrap();
    assert!(!adapter.device_name().is_empty());
    assert!(adapter.stack().is_running());

    adapter.close();
    adapter.close();
    assert!(adapter.is_closed());
}
