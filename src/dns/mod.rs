//! In-stack DNS interception
//!
//! Answers DNS queries sent to the device's resolver address without a
//! kernel socket. The service registers itself on the userspace stack as a
//! UDP endpoint and a TCP listener, decodes each intercepted query and hands
//! it to a [`DnsHandler`].
//!
//! # Architecture
//!
//! ```text
//! NetStack ──► DnsUdpEndpoint ──┐
//!          └─► TcpListener ─────┴─► flow task ──► decode ──► DnsHandler::serve_dns
//!                                       ▲                          │
//!                                       └────── ResponseSink ◄─────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tun_intercept::dns::{DnsInterceptService, DnsServiceConfig, UpstreamForwarder};
//! use tun_intercept::stack::NetStack;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let stack = NetStack::default();
//! let handler = Arc::new(UpstreamForwarder::new(vec!["1.1.1.1:53".parse()?], Duration::from_secs(3)));
//!
//! if let Some(service) = DnsInterceptService::start(&stack, "198.18.0.2:53", handler, DnsServiceConfig::default())? {
//!     println!("listening at {}", service.listen_address());
//!     service.stop();
//! }
//! # Ok(())
//! # }
//! ```

pub mod codec;
mod endpoint;
pub mod error;
mod handler;
mod listen;
pub mod response;
mod service;
mod stats;
mod upstream;

pub use codec::{decode, encode, Framing, MessageReader, MAX_TCP_MESSAGE_SIZE, MAX_UDP_MESSAGE_SIZE, MIN_DNS_MESSAGE_SIZE};
pub use error::{DnsResult, DnsServiceError};
pub use handler::{DnsHandler, ResponseSink};
pub use listen::parse_listen;
pub use service::{ActiveFlow, DnsInterceptService, DnsServiceConfig, DEFAULT_READ_TIMEOUT};
pub use stats::{DnsServiceStats, DnsServiceStatsSnapshot};
pub use upstream::{validate_response, UpstreamForwarder, DEFAULT_UPSTREAM_TIMEOUT};

/// Format a listen address for display, `""` when there is none
///
/// IPv6 addresses are bracketed.
pub fn format_listen(addr: Option<std::net::SocketAddr>) -> String {
    addr.map(|a| a.to_string()).unwrap_or_default()
}
