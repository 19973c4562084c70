//! Resolver boundary
//!
//! The service decodes each query and hands it to a [`DnsHandler`] together
//! with a [`ResponseSink`] bound to the flow it arrived on. The handler owns
//! the resolution strategy; failures are reported to the client as DNS
//! responses (see [`response`](super::response)), never as Rust errors.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::Message;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::trace;

use super::codec::{encode, Framing};
use super::error::{DnsResult, DnsServiceError};
use super::stats::DnsServiceStats;
use crate::stack::{Flow, FlowId, FlowIo, TransportProtocol};

/// Answers DNS queries arriving on intercepted flows
#[async_trait]
pub trait DnsHandler: Send + Sync + 'static {
    /// Serve one query
    ///
    /// Called on its own task; several calls for the same flow may run
    /// concurrently. Write zero or one response through `response`.
    async fn serve_dns(&self, request: Message, response: ResponseSink);
}

#[async_trait]
impl<H: DnsHandler + ?Sized> DnsHandler for Arc<H> {
    async fn serve_dns(&self, request: Message, response: ResponseSink) {
        (**self).serve_dns(request, response).await;
    }
}

/// Write side of one flow
///
/// Cloneable; every clone writes to the same flow through one async mutex,
/// so concurrently produced responses never interleave on the wire.
#[derive(Clone)]
pub struct ResponseSink {
    writer: Arc<Mutex<WriteHalf<Box<dyn FlowIo>>>>,
    framing: Framing,
    protocol: TransportProtocol,
    id: FlowId,
    stats: Arc<DnsServiceStats>,
}

impl ResponseSink {
    /// Split a flow into its read half and a sink for its write half
    pub(crate) fn split(flow: Flow, stats: Arc<DnsServiceStats>) -> (ReadHalf<Box<dyn FlowIo>>, Self) {
        let (protocol, id, io) = flow.into_parts();
        let (reader, writer) = tokio::io::split(io);
        let sink = Self {
            writer: Arc::new(Mutex::new(writer)),
            framing: Framing::for_transport(protocol),
            protocol,
            id,
            stats,
        };
        (reader, sink)
    }

    /// Encode and write a response
    ///
    /// # Errors
    ///
    /// Encoding, framing or write failure.
    pub async fn write_msg(&self, message: &Message) -> DnsResult<()> {
        let bytes = encode(message)?;
        self.write_raw(&bytes).await
    }

    /// Write an already encoded response
    ///
    /// The framed bytes go out in one `write_all` while the flow's write
    /// lock is held.
    ///
    /// # Errors
    ///
    /// Framing or write failure.
    pub async fn write_raw(&self, message: &[u8]) -> DnsResult<()> {
        let framed = self.framing.frame(message)?;

        let result = {
            let mut writer = self.writer.lock().await;
            match writer.write_all(&framed).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };

        match result {
            Ok(()) => {
                DnsServiceStats::incr(&self.stats.responses_written);
                DnsServiceStats::add(&self.stats.bytes_sent, framed.len());
                trace!(id = %self.id, len = message.len(), "DNS response written");
                Ok(())
            }
            Err(e) => {
                DnsServiceStats::incr(&self.stats.write_errors);
                Err(DnsServiceError::network_io("failed to write response", e))
            }
        }
    }

    /// Address the query was sent to
    pub fn local_addr(&self) -> SocketAddr {
        self.id.local
    }

    /// Client address
    pub fn remote_addr(&self) -> SocketAddr {
        self.id.remote
    }

    pub fn flow_id(&self) -> FlowId {
        self.id
    }

    pub fn protocol(&self) -> TransportProtocol {
        self.protocol
    }
}

impl std::fmt::Debug for ResponseSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseSink")
            .field("protocol", &self.protocol)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
