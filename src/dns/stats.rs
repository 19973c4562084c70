//! Counters for the DNS interception service

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Statistics shared by every flow of one service
#[derive(Debug, Default)]
pub struct DnsServiceStats {
    /// UDP flows claimed
    pub(crate) udp_flows: AtomicU64,
    /// TCP connections accepted
    pub(crate) tcp_flows: AtomicU64,
    /// Flows whose loop has ended
    pub(crate) flows_closed: AtomicU64,
    /// Flows closed by the idle deadline
    pub(crate) flows_timed_out: AtomicU64,
    /// Messages read and decoded
    pub(crate) queries_received: AtomicU64,
    /// Messages that failed to decode
    pub(crate) decode_errors: AtomicU64,
    /// Read or framing errors (each closes its flow)
    pub(crate) read_errors: AtomicU64,
    /// Responses written back
    pub(crate) responses_written: AtomicU64,
    /// Response writes that failed
    pub(crate) write_errors: AtomicU64,
    /// Request bytes received
    pub(crate) bytes_received: AtomicU64,
    /// Response bytes sent (including framing)
    pub(crate) bytes_sent: AtomicU64,
    /// ICMP control notifications received
    pub(crate) control_messages: AtomicU64,
}

impl DnsServiceStats {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Get queries received
    #[must_use]
    pub fn queries_received(&self) -> u64 {
        self.queries_received.load(Ordering::Relaxed)
    }

    /// Get responses written
    #[must_use]
    pub fn responses_written(&self) -> u64 {
        self.responses_written.load(Ordering::Relaxed)
    }

    /// Get snapshot
    #[must_use]
    pub fn snapshot(&self) -> DnsServiceStatsSnapshot {
        DnsServiceStatsSnapshot {
            udp_flows: self.udp_flows.load(Ordering::Relaxed),
            tcp_flows: self.tcp_flows.load(Ordering::Relaxed),
            flows_closed: self.flows_closed.load(Ordering::Relaxed),
            flows_timed_out: self.flows_timed_out.load(Ordering::Relaxed),
            queries_received: self.queries_received(),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            responses_written: self.responses_written(),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            control_messages: self.control_messages.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of DNS service statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DnsServiceStatsSnapshot {
    pub udp_flows: u64,
    pub tcp_flows: u64,
    pub flows_closed: u64,
    pub flows_timed_out: u64,
    pub queries_received: u64,
    pub decode_errors: u64,
    pub read_errors: u64,
    pub responses_written: u64,
    pub write_errors: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub control_messages: u64,
}
