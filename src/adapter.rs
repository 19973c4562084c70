//! Tunnel adapter
//!
//! [`TunAdapter`] ties one TUN device to one userspace stack and, on demand,
//! one in-stack DNS responder. It is the surface a proxy client drives:
//!
//! ```text
//! TunDevice ──► LinkEndpoint ──► NetStack ──┬─► DnsInterceptService ──► DnsHandler
//!                                           └─► unclaimed_flows() ──► proxy layer
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::device::{DeviceResult, TunDevice};
use crate::dns::{DnsHandler, DnsInterceptService, DnsServiceConfig, DnsServiceError, DnsServiceStatsSnapshot};
use crate::error::{Result, TunInterceptError};
use crate::stack::{Flow, NetStack, StackConfig, StackStatsSnapshot};

/// Adapter settings
#[derive(Debug, Clone, Default)]
pub struct AdapterConfig {
    pub stack: StackConfig,
    pub dns: DnsServiceConfig,
}

/// TUN device, stack and optional DNS responder
pub struct TunAdapter {
    device: TunDevice,
    stack: NetStack,
    dns_config: DnsServiceConfig,
    dns: Mutex<Option<DnsInterceptService>>,
    closed: AtomicBool,
}

impl TunAdapter {
    /// Open `device_url` and start the stack on it
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Device errors from opening the interface or building its link
    /// endpoint; the device is closed again on failure.
    pub fn open(device_url: &str, config: AdapterConfig) -> Result<Self> {
        let device = TunDevice::open(device_url)?;
        Self::with_device(device, config)
    }

    /// Start the stack on an already-open device
    ///
    /// # Errors
    ///
    /// See [`open`](Self::open).
    pub fn with_device(device: TunDevice, config: AdapterConfig) -> Result<Self> {
        let link = device.as_link_endpoint()?;
        let mtu = link.mtu();

        let stack = NetStack::new(config.stack);
        if let Err(e) = stack.attach(link, mtu) {
            device.close();
            return Err(e.into());
        }

        info!(device = %device.name(), url = %device.url(), mtu, "Tunnel adapter started");
        Ok(Self {
            device,
            stack,
            dns_config: config.dns,
            dns: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Locator the device was opened with
    pub fn device_url(&self) -> &str {
        self.device.url()
    }

    /// Interface name reported by the OS
    pub fn device_name(&self) -> &str {
        self.device.name()
    }

    /// Device MTU
    ///
    /// # Errors
    ///
    /// `MtuUnavailable` when the interface cannot be queried.
    pub fn mtu(&self) -> DeviceResult<u32> {
        self.device.mtu()
    }

    pub fn stack(&self) -> &NetStack {
        &self.stack
    }

    /// Start the DNS responder on `listen`, replacing any running one
    ///
    /// A disabled `listen` (port 0, empty) only stops the previous
    /// responder.
    ///
    /// # Errors
    ///
    /// `ResolverNotProvided` without a resolver, `Closed` after
    /// [`close`](Self::close), and the service's own start errors.
    pub fn create_dns_server(&self, resolver: Option<Arc<dyn DnsHandler>>, listen: &str) -> Result<()> {
        if self.is_closed() {
            return Err(TunInterceptError::Closed);
        }
        let Some(resolver) = resolver else {
            return Err(DnsServiceError::ResolverNotProvided.into());
        };

        let mut slot = self.dns.lock();
        if let Some(old) = slot.take() {
            old.stop();
        }

        let service = DnsInterceptService::start(&self.stack, listen, resolver, self.dns_config.clone())
            .inspect_err(|e| warn!(listen, error = %e, "Failed to create DNS server on tun"))?;
        if let Some(service) = service {
            info!("Tun DNS server listening at {}", service.listen_address());
            *slot = Some(service);
        }
        Ok(())
    }

    /// Stop the DNS responder, withdrawing its registrations
    ///
    /// No-op when none runs.
    pub fn destroy_dns_server(&self) {
        if let Some(service) = self.dns.lock().take() {
            service.stop();
        }
    }

    /// Listen address of the running responder, `""` when none
    pub fn dns_listen(&self) -> String {
        crate::dns::format_listen(self.dns.lock().as_ref().map(DnsInterceptService::listen_address))
    }

    /// Counters of the running responder
    pub fn dns_stats(&self) -> Option<DnsServiceStatsSnapshot> {
        self.dns.lock().as_ref().map(DnsInterceptService::stats)
    }

    pub fn stack_stats(&self) -> StackStatsSnapshot {
        self.stack.stats()
    }

    /// Flows no endpoint claimed, for the proxy layer
    ///
    /// Can be taken once.
    pub fn unclaimed_flows(&self) -> Option<mpsc::Receiver<Flow>> {
        self.stack.take_unclaimed()
    }

    /// Stop DNS, the stack and the device
    ///
    /// Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.destroy_dns_server();
        self.stack.stop();
        self.device.close();
        info!(device = %self.device.name(), "Tunnel adapter closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for TunAdapter {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for TunAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunAdapter")
            .field("device", &self.device)
            .field("dns_listen", &self.dns_listen())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
