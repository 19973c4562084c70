//! Endpoint identities and the transport-endpoint trait

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use serde::Serialize;

use super::flow::{Flow, FlowId};

/// Network-layer protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkProtocol {
    Ipv4,
    Ipv6,
}

impl NetworkProtocol {
    /// Protocol carrying `addr`
    #[must_use]
    pub fn of(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::Ipv4,
            IpAddr::V6(_) => Self::Ipv6,
        }
    }

    /// Protocols an endpoint bound to `addr` should register for
    ///
    /// IPv4 addresses register IPv4 only. IPv6 addresses register IPv6
    /// only, except the IPv6 unspecified address which registers both.
    #[must_use]
    pub fn for_bind(addr: IpAddr) -> Vec<Self> {
        match addr {
            IpAddr::V4(_) => vec![Self::Ipv4],
            IpAddr::V6(v6) if v6.is_unspecified() => vec![Self::Ipv4, Self::Ipv6],
            IpAddr::V6(_) => vec![Self::Ipv6],
        }
    }
}

/// Transport-layer protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Tcp,
    Udp,
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

/// Local side of an endpoint; the remote side is always a wildcard
///
/// An unspecified local address (`0.0.0.0` or `::`) matches any destination
/// address on the port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId {
    local_address: IpAddr,
    local_port: u16,
}

impl EndpointId {
    pub fn new(local: SocketAddr) -> Self {
        Self {
            local_address: local.ip(),
            local_port: local.port(),
        }
    }

    pub fn local_address(&self) -> IpAddr {
        self.local_address
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn local(&self) -> SocketAddr {
        SocketAddr::new(self.local_address, self.local_port)
    }

    /// Whether the local address is a wildcard
    pub fn is_wildcard(&self) -> bool {
        self.local_address.is_unspecified()
    }

    /// Whether a flow addressed to `dest` belongs to this endpoint
    ///
    /// The port must match exactly; the address must match exactly unless
    /// this identity is a wildcard.
    pub fn matches(&self, dest: &SocketAddr) -> bool {
        dest.port() == self.local_port && (self.is_wildcard() || dest.ip() == self.local_address)
    }

    /// Whether two identities could claim the same destination
    pub(crate) fn overlaps(&self, other: &Self) -> bool {
        self.local_port == other.local_port
            && (self.is_wildcard() || other.is_wildcard() || self.local_address == other.local_address)
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.local())
    }
}

/// Everything the endpoint table keys a registration on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointRegistration {
    pub net_protos: Vec<NetworkProtocol>,
    pub transport: TransportProtocol,
    pub id: EndpointId,
}

impl EndpointRegistration {
    pub fn new(net_protos: Vec<NetworkProtocol>, transport: TransportProtocol, id: EndpointId) -> Self {
        Self {
            net_protos,
            transport,
            id,
        }
    }

    /// Registration for every protocol `id`'s address implies
    pub fn for_id(transport: TransportProtocol, id: EndpointId) -> Self {
        Self::new(NetworkProtocol::for_bind(id.local_address()), transport, id)
    }

    /// Whether a `transport` flow addressed to `dest` falls under this registration
    pub fn accepts(&self, transport: TransportProtocol, dest: &SocketAddr) -> bool {
        self.transport == transport
            && self.net_protos.contains(&NetworkProtocol::of(dest.ip()))
            && self.id.matches(dest)
    }

    pub(crate) fn conflicts_with(&self, other: &Self) -> bool {
        self.transport == other.transport
            && self.net_protos.iter().any(|p| other.net_protos.contains(p))
            && self.id.overlaps(&other.id)
    }
}

/// Transport control notifications the stack can surface to an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlType {
    /// ICMP / ICMPv6 port unreachable for a datagram the endpoint sent
    PortUnreachable,
    /// ICMP / ICMPv6 destination unreachable (any other code)
    HostUnreachable,
}

/// A transport-level consumer of flows
///
/// This is the narrow seam between the stack and services that sit on top
/// of it. Implementations must not block in `handle_flow`; hand the flow to
/// a task instead.
#[async_trait]
pub trait TransportEndpoint: Send + Sync {
    /// Offer a new flow
    ///
    /// Return `Err(flow)` to decline; the stack then offers it elsewhere.
    fn handle_flow(&self, flow: Flow) -> Result<(), Flow>;

    /// Transport control notification for a flow this endpoint owns
    fn handle_control(&self, _control: ControlType, _id: FlowId) {}

    /// Stop accepting flows
    fn close(&self);

    /// Resolve once the endpoint has fully stopped
    async fn wait(&self);
}
