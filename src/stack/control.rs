//! ICMP / ICMPv6 destination-unreachable parsing
//!
//! When a client's kernel rejects a datagram the stack sent on behalf of an
//! endpoint, the error comes back as an ICMP packet quoting the offending IP
//! header plus the first 8 transport bytes. The quoted source is the
//! endpoint's address, which is what the endpoint table is keyed on.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use super::endpoint::{ControlType, TransportProtocol};
use super::flow::FlowId;

const IPPROTO_ICMP: u8 = 1;
const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;
const IPPROTO_ICMPV6: u8 = 58;

const ICMP_DEST_UNREACH: u8 = 3;
const ICMP_PORT_UNREACH: u8 = 3;
const ICMPV6_DEST_UNREACH: u8 = 1;
const ICMPV6_PORT_UNREACH: u8 = 4;

/// ICMP header: type, code, checksum, 4 unused bytes
const ICMP_HEADER_LEN: usize = 8;
const IPV6_HEADER_LEN: usize = 40;

/// Decoded unreachable notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ControlMessage {
    pub control: ControlType,
    pub transport: TransportProtocol,
    pub id: FlowId,
}

/// Parse an ICMP payload carried by an IP packet with protocol `ip_protocol`
///
/// Returns `None` for anything that is not a destination-unreachable for a
/// quoted TCP or UDP packet.
pub(crate) fn parse_unreachable(ip_protocol: u8, icmp: &[u8]) -> Option<ControlMessage> {
    match ip_protocol {
        IPPROTO_ICMP => parse_v4(icmp),
        IPPROTO_ICMPV6 => parse_v6(icmp),
        _ => None,
    }
}

fn transport(proto: u8) -> Option<TransportProtocol> {
    match proto {
        IPPROTO_TCP => Some(TransportProtocol::Tcp),
        IPPROTO_UDP => Some(TransportProtocol::Udp),
        _ => None,
    }
}

fn ports(bytes: &[u8]) -> Option<(u16, u16)> {
    let p = bytes.get(..4)?;
    Some((
        u16::from_be_bytes([p[0], p[1]]),
        u16::from_be_bytes([p[2], p[3]]),
    ))
}

fn parse_v4(icmp: &[u8]) -> Option<ControlMessage> {
    if *icmp.first()? != ICMP_DEST_UNREACH {
        return None;
    }
    let control = match *icmp.get(1)? {
        ICMP_PORT_UNREACH => ControlType::PortUnreachable,
        _ => ControlType::HostUnreachable,
    };

    let inner = icmp.get(ICMP_HEADER_LEN..)?;
    let first = *inner.first()?;
    if first >> 4 != 4 {
        return None;
    }
    let ihl = usize::from(first & 0x0f) * 4;
    if ihl < 20 {
        return None;
    }
    let transport = transport(*inner.get(9)?)?;
    let src: [u8; 4] = inner.get(12..16)?.try_into().ok()?;
    let dst: [u8; 4] = inner.get(16..20)?.try_into().ok()?;
    let (src_port, dst_port) = ports(inner.get(ihl..)?)?;

    Some(ControlMessage {
        control,
        transport,
        id: FlowId::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::from(src)), src_port),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::from(dst)), dst_port),
        ),
    })
}

fn parse_v6(icmp: &[u8]) -> Option<ControlMessage> {
    if *icmp.first()? != ICMPV6_DEST_UNREACH {
        return None;
    }
    let control = match *icmp.get(1)? {
        ICMPV6_PORT_UNREACH => ControlType::PortUnreachable,
        _ => ControlType::HostUnreachable,
    };

    let inner = icmp.get(ICMP_HEADER_LEN..)?;
    if *inner.first()? >> 4 != 6 {
        return None;
    }
    // extension headers are not followed
    let transport = transport(*inner.get(6)?)?;
    let src: [u8; 16] = inner.get(8..24)?.try_into().ok()?;
    let dst: [u8; 16] = inner.get(24..40)?.try_into().ok()?;
    let (src_port, dst_port) = ports(inner.get(IPV6_HEADER_LEN..)?)?;

    Some(ControlMessage {
        control,
        transport,
        id: FlowId::new(
            SocketAddr::new(IpAddr::V6(Ipv6Addr::from(src)), src_port),
            SocketAddr::new(IpAddr::V6(Ipv6Addr::from(dst)), dst_port),
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn icmp_v4(code: u8, proto: u8) -> Vec<u8> {
        let mut pkt = vec![ICMP_DEST_UNREACH, code, 0, 0, 0, 0, 0, 0];
        // quoted IPv4 header, IHL 5
        let mut ip = [0u8; 20];
        ip[0] = 0x45;
        ip[9] = proto;
        ip[12..16].copy_from_slice(&[198, 18, 0, 2]);
        ip[16..20].copy_from_slice(&[10, 0, 0, 7]);
        pkt.extend_from_slice(&ip);
        pkt.extend_from_slice(&53u16.to_be_bytes());
        pkt.extend_from_slice(&40000u16.to_be_bytes());
        pkt.extend_from_slice(&[0, 8, 0, 0]);
        pkt
    }

    #[test]
    fn test_v4_port_unreachable() {
        let msg = parse_unreachable(IPPROTO_ICMP, &icmp_v4(ICMP_PORT_UNREACH, IPPROTO_UDP)).unwrap();
        assert_eq!(msg.control, ControlType::PortUnreachable);
        assert_eq!(msg.transport, TransportProtocol::Udp);
        assert_eq!(msg.id.local, "198.18.0.2:53".parse().unwrap());
        assert_eq!(msg.id.remote, "10.0.0.7:40000".parse().unwrap());
    }

    #[test]
    fn test_v4_host_unreachable() {
        let msg = parse_unreachable(IPPROTO_ICMP, &icmp_v4(1, IPPROTO_TCP)).unwrap();
        assert_eq!(msg.control, ControlType::HostUnreachable);
        assert_eq!(msg.transport, TransportProtocol::Tcp);
    }

    #[test]
    fn test_v4_rejects_other_types() {
        let mut pkt = icmp_v4(ICMP_PORT_UNREACH, IPPROTO_UDP);
        pkt[0] = 8; // echo request
        assert!(parse_unreachable(IPPROTO_ICMP, &pkt).is_none());

        // quoted protocol is neither TCP nor UDP
        assert!(parse_unreachable(IPPROTO_ICMP, &icmp_v4(ICMP_PORT_UNREACH, 47)).is_none());
    }

    #[test]
    fn test_truncated() {
        let pkt = icmp_v4(ICMP_PORT_UNREACH, IPPROTO_UDP);
        assert!(parse_unreachable(IPPROTO_ICMP, &pkt[..30]).is_none());
        assert!(parse_unreachable(IPPROTO_ICMP, &[]).is_none());
        assert!(parse_unreachable(IPPROTO_UDP, &pkt).is_none());
    }

    #[test]
    fn test_v6_port_unreachable() {
        let mut pkt = vec![ICMPV6_DEST_UNREACH, ICMPV6_PORT_UNREACH, 0, 0, 0, 0, 0, 0];
        let mut ip = [0u8; 40];
        ip[0] = 0x60;
        ip[6] = IPPROTO_UDP;
        let src: Ipv6Addr = "fd00::2".parse().unwrap();
        let dst: Ipv6Addr = "fd00::7".parse().unwrap();
        ip[8..24].copy_from_slice(&src.octets());
        ip[24..40].copy_from_slice(&dst.octets());
        pkt.extend_from_slice(&ip);
        pkt.extend_from_slice(&53u16.to_be_bytes());
        pkt.extend_from_slice(&5353u16.to_be_bytes());

        let msg = parse_unreachable(IPPROTO_ICMPV6, &pkt).unwrap();
        assert_eq!(msg.control, ControlType::PortUnreachable);
        assert_eq!(msg.id.local, "[fd00::2]:53".parse().unwrap());
        assert_eq!(msg.id.remote, "[fd00::7]:5353".parse().unwrap());
    }
}
