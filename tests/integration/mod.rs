//! Integration tests for tun-intercept
//!
//! # Test Organization
//!
//! - `dns_service`: DNS responder over in-memory UDP and TCP flows
//! - `stack`: endpoint registration, flow routing, and raw IPv4 packets
//!   through an attached link
//! - `device`: locator handling and inherited-descriptor validation
//!
//! # Test Requirements
//!
//! - Flows are built from `DatagramPipe` and `tokio::io::duplex`, so most
//!   tests need no privileges
//! - Tests marked with `#[ignore]` need CAP_NET_ADMIN and a TUN device

pub mod common;
pub mod device;
pub mod dns_service;
pub mod stack;
