//! Minimal UDP forwarding handler
//!
//! Stands in for a full resolver when the binary runs on its own: every
//! query is relayed verbatim to the configured servers, first answer wins.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Message, OpCode};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::codec::{decode, encode, MAX_UDP_MESSAGE_SIZE};
use super::error::{DnsResult, DnsServiceError};
use super::handler::{DnsHandler, ResponseSink};
use super::response;

/// Default per-server query timeout
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(3);

/// Receive buffer for upstream responses
const UDP_RECV_BUFFER_SIZE: usize = 4096;

/// Check that a response belongs to a query
///
/// Compares the id and the first question's name, type and class.
pub fn validate_response(query: &Message, response: &Message) -> bool {
    if query.id() != response.id() {
        return false;
    }

    match (query.queries().first(), response.queries().first()) {
        (Some(q), Some(r)) => {
            q.name() == r.name() && q.query_type() == r.query_type() && q.query_class() == r.query_class()
        }
        _ => false,
    }
}

/// Forwards queries over UDP to a list of servers
#[derive(Debug, Clone)]
pub struct UpstreamForwarder {
    servers: Vec<SocketAddr>,
    timeout: Duration,
}

impl UpstreamForwarder {
    pub fn new(servers: Vec<SocketAddr>, timeout: Duration) -> Self {
        Self { servers, timeout }
    }

    pub fn servers(&self) -> &[SocketAddr] {
        &self.servers
    }

    /// Try each server in order until one gives a valid answer
    ///
    /// Returns the raw response bytes so the client gets exactly what the
    /// server sent.
    ///
    /// # Errors
    ///
    /// The last server's error, or `UpstreamError` with no servers.
    pub async fn exchange(&self, query: &Message) -> DnsResult<Vec<u8>> {
        let query_bytes = encode(query)?;
        let mut last_error = None;

        for server in &self.servers {
            match self.query_once(*server, query, &query_bytes).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => {
                    debug!(upstream = %server, error = %e, "Upstream query failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| DnsServiceError::upstream("-", "no upstream servers configured")))
    }

    async fn query_once(&self, server: SocketAddr, query: &Message, query_bytes: &[u8]) -> DnsResult<Vec<u8>> {
        let bind: SocketAddr = if server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind)
            .await
            .map_err(|e| DnsServiceError::network_io("failed to bind UDP socket", e))?;

        socket
            .send_to(query_bytes, server)
            .await
            .map_err(|e| DnsServiceError::network_io(format!("failed to send UDP query to {server}"), e))?;

        let mut recv_buf = vec![0u8; UDP_RECV_BUFFER_SIZE];
        let (len, src) = match timeout(self.timeout, socket.recv_from(&mut recv_buf)).await {
            Ok(Ok(received)) => received,
            Ok(Err(e)) => {
                return Err(DnsServiceError::network_io(
                    format!("failed to receive UDP response from {server}"),
                    e,
                ))
            }
            Err(_) => return Err(DnsServiceError::timeout(format!("UDP query to {server}"), self.timeout)),
        };

        if src != server {
            return Err(DnsServiceError::upstream(
                server.to_string(),
                format!("response from unexpected source: {src} (expected {server})"),
            ));
        }

        recv_buf.truncate(len.min(MAX_UDP_MESSAGE_SIZE));
        let response = decode(&recv_buf)?;
        if !validate_response(query, &response) {
            return Err(DnsServiceError::upstream(
                server.to_string(),
                "response validation failed (ID or QNAME mismatch)",
            ));
        }

        Ok(recv_buf)
    }
}

#[async_trait]
impl DnsHandler for UpstreamForwarder {
    async fn serve_dns(&self, request: Message, sink: ResponseSink) {
        let reply = if request.op_code() != OpCode::Query {
            response::notimp(&request)
        } else if request.queries().is_empty() {
            response::formerr(&request)
        } else {
            match self.exchange(&request).await {
                Ok(bytes) => {
                    if let Err(e) = sink.write_raw(&bytes).await {
                        debug!(id = %sink.flow_id(), error = %e, "Failed to write upstream answer");
                    }
                    return;
                }
                Err(e) => {
                    warn!(
                        id = %sink.flow_id(),
                        query = %request.queries()[0].name(),
                        error = %e,
                        "All upstream servers failed, answering SERVFAIL"
                    );
                    response::servfail(&request)
                }
            }
        };

        if let Err(e) = sink.write_msg(&reply).await {
            debug!(id = %sink.flow_id(), error = %e, "Failed to write error response");
        }
    }
}
