//! tun-intercept: TUN capture with an in-stack DNS responder
//!
//! This crate exposes a TUN interface to the operating system, feeds the
//! packets written to it into a userspace TCP/IP stack, and answers DNS
//! queries sent to the device's resolver address from inside that stack.
//!
//! # Features
//!
//! - **TUN devices**: open by name (`dev://tun0?mtu=1500`) or adopt an
//!   inherited descriptor (`fd://5`) on Linux and macOS
//! - **Stack registration**: transport endpoints claim flows by
//!   `(address, port)`; unclaimed flows go to the proxy layer
//! - **DNS interception**: UDP and length-prefixed TCP, per-flow idle
//!   deadlines, pluggable [`DnsHandler`](dns::DnsHandler)
//!
//! # Architecture
//!
//! ```text
//! OS ──► TunDevice ──► LinkEndpoint ──► NetStack ──► DnsInterceptService ──► DnsHandler
//!  ▲                                        │                 │
//!  └────────────────────────────────────────┴──── response ◄──┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tun_intercept::adapter::{AdapterConfig, TunAdapter};
//! use tun_intercept::dns::UpstreamForwarder;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let adapter = TunAdapter::open("dev://tun0?mtu=1500", AdapterConfig::default())?;
//! let resolver = Arc::new(UpstreamForwarder::new(vec!["1.1.1.1:53".parse()?], Duration::from_secs(3)));
//! adapter.create_dns_server(Some(resolver), "198.18.0.2:53")?;
//! println!("DNS at {}", adapter.dns_listen());
//! adapter.close();
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`adapter`]: Device + stack + DNS facade
//! - [`config`]: Configuration types and loading
//! - [`device`]: TUN device handle and link endpoint
//! - [`dns`]: In-stack DNS interception
//! - [`error`]: Error types
//! - [`stack`]: Endpoint registration over the userspace stack

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod adapter;
pub mod config;
pub mod device;
pub mod dns;
pub mod error;
pub mod stack;

// Re-export commonly used types at the crate root
pub use adapter::{AdapterConfig, TunAdapter};
pub use config::{Config, DnsConfig, LogConfig, UpstreamConfig};
pub use device::{DeviceError, DeviceLocator, LinkEndpoint, TunDevice};
pub use dns::{DnsHandler, DnsInterceptService, DnsServiceConfig, DnsServiceError, ResponseSink, UpstreamForwarder};
pub use error::{ConfigError, TunInterceptError};
pub use stack::{EndpointId, Flow, FlowId, NetStack, StackError, TransportEndpoint};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
