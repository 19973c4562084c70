//! Shared helpers: query builders and stub resolvers

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};

use tun_intercept::dns::{self, response, DnsHandler, ResponseSink};

pub fn sa(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

/// A query for `domain` with the given id
pub fn a_query(id: u16, domain: &str) -> Message {
    let mut query = Message::new();
    query.set_id(id);
    query.set_message_type(MessageType::Query);
    query.set_op_code(OpCode::Query);
    query.set_recursion_desired(true);
    query.add_query(Query::query(Name::from_ascii(domain).unwrap(), RecordType::A));
    query
}

/// Deterministic answer: one A record derived from the query id
pub fn answer_for(query: &Message) -> Message {
    let mut reply = response::error_response(query, ResponseCode::NoError);
    let [hi, lo] = query.id().to_be_bytes();
    let name = query.queries()[0].name().clone();
    reply.add_answer(Record::from_rdata(name, 60, RData::A(A::from(Ipv4Addr::new(10, 0, hi, lo)))));
    reply
}

/// Answers every query with [`answer_for`]
pub struct IdEchoResolver;

#[async_trait]
impl DnsHandler for IdEchoResolver {
    async fn serve_dns(&self, request: Message, sink: ResponseSink) {
        let _ = sink.write_msg(&answer_for(&request)).await;
    }
}

/// Writes the same pre-encoded A record for `example.com.` to every query,
/// with the id patched to match
pub struct StubResolver {
    pub template: Vec<u8>,
}

impl StubResolver {
    pub fn new(addr: Ipv4Addr) -> Arc<Self> {
        let mut reply = response::error_response(&a_query(0, "example.com."), ResponseCode::NoError);
        reply.add_answer(Record::from_rdata(
            Name::from_ascii("example.com.").unwrap(),
            300,
            RData::A(A::from(addr)),
        ));
        Arc::new(Self {
            template: dns::encode(&reply).unwrap(),
        })
    }

    /// Exact bytes the stub sends for a query with `id`
    pub fn bytes_for(&self, id: u16) -> Vec<u8> {
        let mut bytes = self.template.clone();
        bytes[..2].copy_from_slice(&id.to_be_bytes());
        bytes
    }
}

#[async_trait]
impl DnsHandler for StubResolver {
    async fn serve_dns(&self, request: Message, sink: ResponseSink) {
        let _ = sink.write_raw(&self.bytes_for(request.id())).await;
    }
}

/// Never answers
pub struct SilentResolver;

#[async_trait]
impl DnsHandler for SilentResolver {
    async fn serve_dns(&self, _request: Message, _sink: ResponseSink) {}
}

// ============================================================================
// Raw IPv4 packets for driving an attached link
// ============================================================================

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

const IPV4_HEADER_LEN: usize = 20;

fn checksum(bytes: &[u8]) -> u16 {
    let mut sum = bytes
        .chunks(2)
        .map(|c| u32::from(u16::from_be_bytes([c[0], c.get(1).copied().unwrap_or(0)])))
        .sum::<u32>();
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn v4(addr: SocketAddr) -> Ipv4Addr {
    match addr {
        SocketAddr::V4(a) => *a.ip(),
        SocketAddr::V6(_) => panic!("IPv4 only"),
    }
}

/// Wrap a transport segment (checksum field zeroed) into an IPv4 packet
fn ipv4_packet(src: SocketAddr, dst: SocketAddr, protocol: u8, mut segment: Vec<u8>, checksum_at: usize) -> Vec<u8> {
    let (src_ip, dst_ip) = (v4(src).octets(), v4(dst).octets());
    let segment_len = u16::try_from(segment.len()).unwrap();

    let mut pseudo = Vec::with_capacity(12 + segment.len());
    pseudo.extend_from_slice(&src_ip);
    pseudo.extend_from_slice(&dst_ip);
    pseudo.extend_from_slice(&[0, protocol]);
    pseudo.extend_from_slice(&segment_len.to_be_bytes());
    pseudo.extend_from_slice(&segment);
    let mut sum = checksum(&pseudo);
    if sum == 0 && protocol == IPPROTO_UDP {
        sum = 0xffff;
    }
    segment[checksum_at..checksum_at + 2].copy_from_slice(&sum.to_be_bytes());

    let total_len = u16::try_from(IPV4_HEADER_LEN + segment.len()).unwrap();
    let mut packet = vec![0x45, 0];
    packet.extend_from_slice(&total_len.to_be_bytes());
    packet.extend_from_slice(&[0, 0, 0x40, 0, 64, protocol, 0, 0]);
    packet.extend_from_slice(&src_ip);
    packet.extend_from_slice(&dst_ip);
    let header_sum = checksum(&packet);
    packet[10..12].copy_from_slice(&header_sum.to_be_bytes());
    packet.extend_from_slice(&segment);
    packet
}

/// IPv4/UDP datagram from `src` to `dst`
pub fn ipv4_udp(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let udp_len = u16::try_from(8 + payload.len()).unwrap();
    let mut segment = Vec::with_capacity(8 + payload.len());
    segment.extend_from_slice(&src.port().to_be_bytes());
    segment.extend_from_slice(&dst.port().to_be_bytes());
    segment.extend_from_slice(&udp_len.to_be_bytes());
    segment.extend_from_slice(&[0, 0]);
    segment.extend_from_slice(payload);
    ipv4_packet(src, dst, IPPROTO_UDP, segment, 6)
}

/// IPv4 TCP SYN from `src` to `dst`
pub fn ipv4_tcp_syn(src: SocketAddr, dst: SocketAddr, seq: u32) -> Vec<u8> {
    let mut segment = Vec::with_capacity(20);
    segment.extend_from_slice(&src.port().to_be_bytes());
    segment.extend_from_slice(&dst.port().to_be_bytes());
    segment.extend_from_slice(&seq.to_be_bytes());
    segment.extend_from_slice(&0u32.to_be_bytes());
    // data offset 5 words, SYN, window 65535, checksum, urgent pointer
    segment.extend_from_slice(&[0x50, 0x02, 0xff, 0xff, 0, 0, 0, 0]);
    ipv4_packet(src, dst, IPPROTO_TCP, segment, 16)
}

/// Fields of an IPv4 packet written back onto the link
pub struct ParsedPacket {
    pub protocol: u8,
    pub src: SocketAddr,
    pub dst: SocketAddr,
    /// Transport segment without the IP header
    pub segment: Vec<u8>,
}

impl ParsedPacket {
    pub fn parse(packet: &[u8]) -> Self {
        assert_eq!(packet[0] >> 4, 4, "not an IPv4 packet");
        let header_len = usize::from(packet[0] & 0x0f) * 4;
        let total_len = usize::from(u16::from_be_bytes([packet[2], packet[3]]));
        let segment = packet[header_len..total_len].to_vec();
        let ip = |at: usize| Ipv4Addr::new(packet[at], packet[at + 1], packet[at + 2], packet[at + 3]);
        let src_port = u16::from_be_bytes([segment[0], segment[1]]);
        let dst_port = u16::from_be_bytes([segment[2], segment[3]]);
        Self {
            protocol: packet[9],
            src: SocketAddr::from((ip(12), src_port)),
            dst: SocketAddr::from((ip(16), dst_port)),
            segment,
        }
    }

    /// UDP payload
    pub fn udp_payload(&self) -> &[u8] {
        assert_eq!(self.protocol, IPPROTO_UDP);
        &self.segment[8..]
    }

    /// TCP flags byte
    pub fn tcp_flags(&self) -> u8 {
        assert_eq!(self.protocol, IPPROTO_TCP);
        self.segment[13]
    }
}
