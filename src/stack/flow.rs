//! Flows handed from the stack to endpoints

use std::fmt;
use std::net::SocketAddr;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};

use super::endpoint::TransportProtocol;

/// Byte channel of a flow
///
/// For UDP flows each read yields one datagram and each write sends one.
/// TCP flows are plain byte streams.
pub trait FlowIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> FlowIo for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Addresses of a flow, seen from the endpoint that serves it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FlowId {
    /// Address the client sent to (the endpoint's side)
    pub local: SocketAddr,
    /// Client address
    pub remote: SocketAddr,
}

impl FlowId {
    pub fn new(local: SocketAddr, remote: SocketAddr) -> Self {
        Self { local, remote }
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.remote, self.local)
    }
}

/// One accepted UDP pseudo-connection or TCP connection
pub struct Flow {
    protocol: TransportProtocol,
    id: FlowId,
    io: Box<dyn FlowIo>,
}

impl Flow {
    pub fn new(protocol: TransportProtocol, id: FlowId, io: impl FlowIo) -> Self {
        Self {
            protocol,
            id,
            io: Box::new(io),
        }
    }

    pub fn udp(id: FlowId, io: impl FlowIo) -> Self {
        Self::new(TransportProtocol::Udp, id, io)
    }

    pub fn tcp(id: FlowId, io: impl FlowIo) -> Self {
        Self::new(TransportProtocol::Tcp, id, io)
    }

    pub fn protocol(&self) -> TransportProtocol {
        self.protocol
    }

    pub fn id(&self) -> FlowId {
        self.id
    }

    pub fn into_io(self) -> Box<dyn FlowIo> {
        self.io
    }

    pub fn into_parts(self) -> (TransportProtocol, FlowId, Box<dyn FlowIo>) {
        (self.protocol, self.id, self.io)
    }
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow")
            .field("protocol", &self.protocol)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
