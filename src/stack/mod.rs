//! Stack registration layer
//!
//! [`NetStack`] drives an `ipstack` instance over a link and hands every flow
//! it accepts to whichever registered [`TransportEndpoint`] claims it.
//! Services on top (the DNS interceptor) only ever see [`Flow`]s, never
//! `ipstack` types.
//!
//! # Architecture
//!
//! ```text
//! LinkEndpoint ──► ipstack::IpStack ──► accept loop ──► deliver(flow)
//!                                             │              │
//!                                             │      endpoint table (RwLock)
//!                                             │       │            │
//!                                             │   claimed     unclaimed ──► take_unclaimed()
//!                                             │
//!                                             └─► ICMP unreachable ──► deliver_control()
//! ```

mod control;
mod endpoint;
mod error;
mod flow;
mod listener;
mod pipe;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

pub use endpoint::{
    ControlType, EndpointId, EndpointRegistration, NetworkProtocol, TransportEndpoint, TransportProtocol,
};
pub use error::{StackError, StackResult};
pub use flow::{Flow, FlowId, FlowIo};
pub use listener::{ListenerHandle, TcpListener};
pub use pipe::DatagramPipe;

/// Default capacity of the unclaimed-flow channel and listener backlogs
pub const DEFAULT_CHANNEL_SIZE: usize = 1024;

/// Pause after an accept error so a dead link does not spin
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Stack settings
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Capacity of the unclaimed-flow channel and of each TCP listener backlog
    pub channel_size: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            channel_size: DEFAULT_CHANNEL_SIZE,
        }
    }
}

/// Stack counters
#[derive(Debug, Default)]
pub struct StackStats {
    /// TCP connections accepted by the stack
    pub tcp_flows: AtomicU64,
    /// UDP pseudo-connections accepted by the stack
    pub udp_flows: AtomicU64,
    /// Flows claimed by a registered endpoint
    pub flows_claimed: AtomicU64,
    /// Flows passed to the unclaimed channel
    pub flows_unclaimed: AtomicU64,
    /// Flows nobody wanted (no consumer, or channel full)
    pub flows_dropped: AtomicU64,
    /// Control notifications delivered to an endpoint
    pub control_delivered: AtomicU64,
}

impl StackStats {
    /// Create a snapshot of the current statistics
    pub fn snapshot(&self) -> StackStatsSnapshot {
        StackStatsSnapshot {
            tcp_flows: self.tcp_flows.load(Ordering::Relaxed),
            udp_flows: self.udp_flows.load(Ordering::Relaxed),
            flows_claimed: self.flows_claimed.load(Ordering::Relaxed),
            flows_unclaimed: self.flows_unclaimed.load(Ordering::Relaxed),
            flows_dropped: self.flows_dropped.load(Ordering::Relaxed),
            control_delivered: self.control_delivered.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`StackStats`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct StackStatsSnapshot {
    pub tcp_flows: u64,
    pub udp_flows: u64,
    pub flows_claimed: u64,
    pub flows_unclaimed: u64,
    pub flows_dropped: u64,
    pub control_delivered: u64,
}

struct Registered {
    registration: EndpointRegistration,
    endpoint: Arc<dyn TransportEndpoint>,
}

fn same_endpoint(a: &Arc<dyn TransportEndpoint>, b: &Arc<dyn TransportEndpoint>) -> bool {
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}

pub(crate) struct StackInner {
    config: StackConfig,
    endpoints: RwLock<Vec<Registered>>,
    unclaimed_tx: mpsc::Sender<Flow>,
    unclaimed_rx: Mutex<Option<mpsc::Receiver<Flow>>>,
    running: AtomicBool,
    shutdown: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
    stats: StackStats,
}

impl StackInner {
    fn register(&self, registration: EndpointRegistration, endpoint: Arc<dyn TransportEndpoint>) -> StackResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(StackError::Shutdown);
        }
        if registration.net_protos.is_empty() {
            return Err(StackError::InvalidRegistration {
                local: registration.id.local(),
                reason: "no network protocol".into(),
            });
        }

        let mut table = self.endpoints.write();
        if table.iter().any(|r| r.registration.conflicts_with(&registration)) {
            return Err(StackError::PortInUse {
                transport: registration.transport,
                local: registration.id.local(),
            });
        }
        debug!(
            transport = %registration.transport,
            local = %registration.id,
            protos = ?registration.net_protos,
            "Registered transport endpoint"
        );
        table.push(Registered { registration, endpoint });
        Ok(())
    }

    pub(crate) fn unregister(&self, registration: &EndpointRegistration, endpoint: &Arc<dyn TransportEndpoint>) -> bool {
        let mut table = self.endpoints.write();
        let before = table.len();
        table.retain(|r| !(r.registration == *registration && same_endpoint(&r.endpoint, endpoint)));
        let removed = table.len() != before;
        if removed {
            debug!(
                transport = %registration.transport,
                local = %registration.id,
                "Unregistered transport endpoint"
            );
        }
        removed
    }

    fn deliver(&self, flow: Flow) -> Result<(), Flow> {
        // snapshot so endpoints may (un)register from inside handle_flow
        let candidates: Vec<Arc<dyn TransportEndpoint>> = self
            .endpoints
            .read()
            .iter()
            .filter(|r| r.registration.accepts(flow.protocol(), &flow.id().local))
            .map(|r| Arc::clone(&r.endpoint))
            .collect();

        let mut flow = flow;
        for endpoint in candidates {
            match endpoint.handle_flow(flow) {
                Ok(()) => {
                    self.stats.flows_claimed.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(declined) => flow = declined,
            }
        }
        Err(flow)
    }

    fn deliver_control(&self, transport: TransportProtocol, control: ControlType, id: FlowId) -> bool {
        let target = self
            .endpoints
            .read()
            .iter()
            .find(|r| r.registration.accepts(transport, &id.local))
            .map(|r| Arc::clone(&r.endpoint));

        match target {
            Some(endpoint) => {
                endpoint.handle_control(control, id);
                self.stats.control_delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Deliver, falling back to the unclaimed channel
    fn dispatch(&self, flow: Flow) {
        let Err(flow) = self.deliver(flow) else {
            return;
        };
        if self.unclaimed_rx.lock().is_some() {
            // nobody took the receiver
            trace!(id = %flow.id(), "Dropping unclaimed flow");
            self.stats.flows_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        match self.unclaimed_tx.try_send(flow) {
            Ok(()) => {
                self.stats.flows_unclaimed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                let flow = match e {
                    mpsc::error::TrySendError::Full(f) | mpsc::error::TrySendError::Closed(f) => f,
                };
                debug!(id = %flow.id(), "Unclaimed flow channel unavailable, dropping flow");
                self.stats.flows_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn handle_stream(&self, stream: ipstack::IpStackStream) {
        match stream {
            ipstack::IpStackStream::Tcp(tcp_stream) => {
                // ipstack: local_addr is the client, peer_addr the destination
                let id = FlowId::new(tcp_stream.peer_addr(), tcp_stream.local_addr());
                trace!(%id, "TCP connection accepted");
                self.stats.tcp_flows.fetch_add(1, Ordering::Relaxed);
                self.dispatch(Flow::tcp(id, tcp_stream));
            }
            ipstack::IpStackStream::Udp(udp_stream) => {
                let id = FlowId::new(udp_stream.peer_addr(), udp_stream.local_addr());
                trace!(%id, "UDP stream accepted");
                self.stats.udp_flows.fetch_add(1, Ordering::Relaxed);
                self.dispatch(Flow::udp(id, udp_stream));
            }
            ipstack::IpStackStream::UnknownTransport(unknown) => {
                let protocol: u8 = unknown.ip_protocol().into();
                match control::parse_unreachable(protocol, &unknown.payload()[..]) {
                    Some(msg) => {
                        if !self.deliver_control(msg.transport, msg.control, msg.id) {
                            trace!(id = %msg.id, control = ?msg.control, "No endpoint for control message");
                        }
                    }
                    None => trace!(
                        "Unknown transport packet: {} -> {} (protocol {})",
                        unknown.src_addr(),
                        unknown.dst_addr(),
                        protocol
                    ),
                }
            }
            ipstack::IpStackStream::UnknownNetwork(packet) => {
                trace!("Unknown network packet: {} bytes", packet.len());
            }
        }
    }
}

/// Accept loop driving one `ipstack` instance
async fn accept_loop_task(mut ip_stack: ipstack::IpStack, inner: Arc<StackInner>) {
    debug!("Accept loop task started");

    loop {
        let accepted = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            accepted = ip_stack.accept() => accepted,
        };
        match accepted {
            Ok(stream) => inner.handle_stream(stream),
            Err(e) => {
                if inner.shutdown.is_cancelled() {
                    break;
                }
                warn!("ipstack accept error: {:?}", e);
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }

    debug!("Accept loop task stopped");
}

/// Endpoint table plus the task that feeds it from a link
///
/// Cheap to clone; clones share the table.
#[derive(Clone)]
pub struct NetStack {
    inner: Arc<StackInner>,
}

impl NetStack {
    pub fn new(config: StackConfig) -> Self {
        let (unclaimed_tx, unclaimed_rx) = mpsc::channel(config.channel_size.max(1));
        Self {
            inner: Arc::new(StackInner {
                config,
                endpoints: RwLock::new(Vec::new()),
                unclaimed_tx,
                unclaimed_rx: Mutex::new(Some(unclaimed_rx)),
                running: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                driver: Mutex::new(None),
                stats: StackStats::default(),
            }),
        }
    }

    /// Start feeding the stack from `link`
    ///
    /// # Errors
    ///
    /// `AlreadyRunning` on a second call, `Shutdown` after [`stop`](Self::stop).
    pub fn attach<L>(&self, link: L, mtu: u32) -> StackResult<()>
    where
        L: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if self.inner.shutdown.is_cancelled() {
            return Err(StackError::Shutdown);
        }
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(StackError::AlreadyRunning);
        }

        let mut ipstack_config = ipstack::IpStackConfig::default();
        ipstack_config.mtu(u16::try_from(mtu).unwrap_or(u16::MAX));
        let ip_stack = ipstack::IpStack::new(ipstack_config, link);

        let task = tokio::spawn(accept_loop_task(ip_stack, Arc::clone(&self.inner)));
        *self.inner.driver.lock() = Some(task);
        info!(mtu, "Network stack attached");
        Ok(())
    }

    /// Add an endpoint to the table
    ///
    /// # Errors
    ///
    /// `PortInUse` if an existing registration could claim the same flows.
    pub fn register_transport_endpoint(
        &self,
        registration: EndpointRegistration,
        endpoint: Arc<dyn TransportEndpoint>,
    ) -> StackResult<()> {
        self.inner.register(registration, endpoint)
    }

    /// Remove a registration previously added with the same endpoint
    ///
    /// Returns whether anything was removed.
    pub fn unregister_transport_endpoint(
        &self,
        registration: &EndpointRegistration,
        endpoint: &Arc<dyn TransportEndpoint>,
    ) -> bool {
        self.inner.unregister(registration, endpoint)
    }

    /// Listen for TCP connections to `id`
    pub fn listen_tcp(&self, id: EndpointId, net_protos: Vec<NetworkProtocol>) -> StackResult<TcpListener> {
        let registration = EndpointRegistration::new(net_protos, TransportProtocol::Tcp, id);
        let (listener, endpoint) =
            TcpListener::new(registration.clone(), self.inner.config.channel_size, Arc::downgrade(&self.inner));
        self.inner.register(registration, endpoint)?;
        Ok(listener)
    }

    /// Offer a flow to the endpoint table
    ///
    /// Returns the flow if no endpoint claimed it.
    pub fn deliver(&self, flow: Flow) -> Result<(), Flow> {
        self.inner.deliver(flow)
    }

    /// Hand a control notification to the endpoint owning `id.local`
    pub fn deliver_control(&self, transport: TransportProtocol, control: ControlType, id: FlowId) -> bool {
        self.inner.deliver_control(transport, control, id)
    }

    /// Receiver for flows no endpoint claimed
    ///
    /// Can only be taken once. Until it is taken unclaimed flows are dropped.
    pub fn take_unclaimed(&self) -> Option<mpsc::Receiver<Flow>> {
        self.inner.unclaimed_rx.lock().take()
    }

    /// Number of registered endpoints
    pub fn endpoint_count(&self) -> usize {
        self.inner.endpoints.read().len()
    }

    pub fn stats(&self) -> StackStatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst) && !self.inner.shutdown.is_cancelled()
    }

    /// Stop the driver and close every remaining endpoint
    ///
    /// Idempotent.
    pub fn stop(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        if let Some(task) = self.inner.driver.lock().take() {
            task.abort();
        }

        let remaining: Vec<Registered> = std::mem::take(&mut *self.inner.endpoints.write());
        for r in &remaining {
            r.endpoint.close();
        }
        info!(
            endpoints_closed = remaining.len(),
            stats = ?self.inner.stats.snapshot(),
            "Network stack stopped"
        );
    }
}

impl Default for NetStack {
    fn default() -> Self {
        Self::new(StackConfig::default())
    }
}
