//! DNS interception service
//!
//! Registers a UDP endpoint and a TCP listener on a [`NetStack`] for one
//! listen address and serves every intercepted flow with its own task:
//!
//! ```text
//! flow ──► arm deadline ──► read one framed message ──► decode ──► spawn handler
//!   ▲                              │                                    │
//!   └──────────────────────────────┘                                    ▼
//!                      (timeout / EOF / error closes)       ResponseSink::write_*
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::codec::{decode, Framing, MessageReader, MAX_TCP_MESSAGE_SIZE};
use super::endpoint::DnsUdpEndpoint;
use super::error::{DnsResult, DnsServiceError};
use super::handler::{DnsHandler, ResponseSink};
use super::listen::parse_listen;
use super::stats::{DnsServiceStats, DnsServiceStatsSnapshot};
use crate::stack::{
    EndpointId, EndpointRegistration, Flow, FlowId, ListenerHandle, NetStack, NetworkProtocol, TcpListener,
    TransportEndpoint, TransportProtocol,
};

/// Default per-read deadline on a flow
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Service tuning
#[derive(Debug, Clone)]
pub struct DnsServiceConfig {
    /// Idle deadline re-armed before every read
    pub read_timeout: Duration,
    /// Largest accepted TCP frame
    pub max_tcp_message_size: usize,
}

impl Default for DnsServiceConfig {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            max_tcp_message_size: MAX_TCP_MESSAGE_SIZE,
        }
    }
}

/// One entry of the active-flow table
#[derive(Debug, Clone, Serialize)]
pub struct ActiveFlow {
    pub protocol: TransportProtocol,
    pub id: FlowId,
    #[serde(skip)]
    pub started: Instant,
}

/// State shared by the service handle, its endpoint and every flow task
pub(crate) struct ServiceShared {
    handler: Arc<dyn DnsHandler>,
    config: DnsServiceConfig,
    runtime: Handle,
    pub(crate) stats: Arc<DnsServiceStats>,
    active: DashMap<u64, ActiveFlow>,
    next_flow: AtomicU64,
    /// Set by `stop`: no new flows, open ones run to their deadline
    withdrawn: AtomicBool,
    /// Fired when the stack itself closes the endpoint; ends open flows
    shutdown: CancellationToken,
}

impl ServiceShared {
    /// Whether new flows may still be claimed
    pub(crate) fn is_accepting(&self) -> bool {
        !self.withdrawn.load(Ordering::SeqCst) && !self.shutdown.is_cancelled()
    }

    fn withdraw(&self) {
        self.withdrawn.store(true, Ordering::SeqCst);
    }

    pub(crate) fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub(crate) async fn wait_shutdown(&self) {
        self.shutdown.cancelled().await;
    }

    /// Serve `flow` on its own task
    pub(crate) fn spawn_flow(self: &Arc<Self>, flow: Flow) {
        let shared = Arc::clone(self);
        self.runtime.spawn(serve_flow(shared, flow));
    }

    fn track(self: &Arc<Self>, protocol: TransportProtocol, id: FlowId) -> FlowGuard {
        let key = self.next_flow.fetch_add(1, Ordering::Relaxed);
        self.active.insert(
            key,
            ActiveFlow {
                protocol,
                id,
                started: Instant::now(),
            },
        );
        FlowGuard {
            shared: Arc::clone(self),
            key,
        }
    }
}

/// RAII guard removing a flow from the active table
struct FlowGuard {
    shared: Arc<ServiceShared>,
    key: u64,
}

impl Drop for FlowGuard {
    fn drop(&mut self) {
        self.shared.active.remove(&self.key);
        DnsServiceStats::incr(&self.shared.stats.flows_closed);
    }
}

/// Read loop for one flow
async fn serve_flow(shared: Arc<ServiceShared>, flow: Flow) {
    let protocol = flow.protocol();
    let id = flow.id();
    let _guard = shared.track(protocol, id);
    debug!(%id, %protocol, "DNS flow opened");

    let (mut reader, sink) = ResponseSink::split(flow, Arc::clone(&shared.stats));
    let mut messages = MessageReader::new(Framing::for_transport(protocol), shared.config.max_tcp_message_size);
    let read_timeout = shared.config.read_timeout;

    loop {
        let read = tokio::select! {
            biased;
            () = shared.shutdown.cancelled() => {
                trace!(%id, "DNS flow abandoned, stack closed");
                break;
            }
            read = timeout(read_timeout, messages.read(&mut reader)) => read,
        };

        let bytes = match read {
            Ok(Ok(Some(bytes))) => bytes,
            Ok(Ok(None)) => {
                trace!(%id, "DNS flow closed by peer");
                break;
            }
            Ok(Err(e)) => {
                DnsServiceStats::incr(&shared.stats.read_errors);
                if e.is_connection_closed() {
                    debug!(%id, error = %e, "DNS flow read failed");
                } else {
                    warn!(%id, error = %e, "DNS flow read failed, closing");
                }
                break;
            }
            Err(_) => {
                DnsServiceStats::incr(&shared.stats.flows_timed_out);
                debug!(%id, timeout = ?read_timeout, "DNS flow idle, closing");
                break;
            }
        };
        DnsServiceStats::add(&shared.stats.bytes_received, bytes.len());

        let request = match decode(bytes) {
            Ok(request) => request,
            Err(e) => {
                DnsServiceStats::incr(&shared.stats.decode_errors);
                warn!(%id, error = %e, "Dropping undecodable DNS message");
                continue;
            }
        };
        DnsServiceStats::incr(&shared.stats.queries_received);
        trace!(%id, qid = request.id(), "DNS query received");

        let handler = Arc::clone(&shared.handler);
        let sink = sink.clone();
        shared.runtime.spawn(async move {
            handler.serve_dns(request, sink).await;
        });
    }

    debug!(%id, "DNS flow finished");
}

/// Accept loop for the TCP listener
async fn accept_loop(shared: Arc<ServiceShared>, mut listener: TcpListener) {
    loop {
        let accepted = tokio::select! {
            biased;
            () = shared.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok(flow) => {
                DnsServiceStats::incr(&shared.stats.tcp_flows);
                shared.spawn_flow(flow);
            }
            Err(e) => {
                debug!(error = %e, "DNS TCP listener stopped");
                break;
            }
        }
    }
}

/// In-stack DNS responder for one listen address
pub struct DnsInterceptService {
    listen: SocketAddr,
    stack: NetStack,
    shared: Arc<ServiceShared>,
    udp_registration: EndpointRegistration,
    udp_endpoint: Arc<dyn TransportEndpoint>,
    tcp_listener: ListenerHandle,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl DnsInterceptService {
    /// Register on `stack` and start serving
    ///
    /// Returns `Ok(None)` when `listen` disables the service (port `0`,
    /// empty or absent port). Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// `AddressParse` for a malformed `listen`; `EndpointRegistrationFailed`
    /// if either registration is refused, after undoing the other.
    pub fn start(
        stack: &NetStack,
        listen: &str,
        handler: Arc<dyn DnsHandler>,
        config: DnsServiceConfig,
    ) -> DnsResult<Option<Self>> {
        let Some(addr) = parse_listen(listen)? else {
            debug!(listen, "DNS listen address disabled");
            return Ok(None);
        };
        let runtime = Handle::try_current().map_err(|e| DnsServiceError::network(e.to_string()))?;

        let id = EndpointId::new(addr);
        let net_protos = NetworkProtocol::for_bind(addr.ip());

        let shared = Arc::new(ServiceShared {
            handler,
            config,
            runtime,
            stats: Arc::new(DnsServiceStats::default()),
            active: DashMap::new(),
            next_flow: AtomicU64::new(0),
            withdrawn: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });

        let udp_registration = EndpointRegistration::new(net_protos.clone(), TransportProtocol::Udp, id);
        let udp_endpoint: Arc<dyn TransportEndpoint> = Arc::new(DnsUdpEndpoint::new(id, Arc::clone(&shared)));
        stack
            .register_transport_endpoint(udp_registration.clone(), Arc::clone(&udp_endpoint))
            .map_err(|e| DnsServiceError::registration(TransportProtocol::Udp, e))?;

        let listener = match stack.listen_tcp(id, net_protos) {
            Ok(listener) => listener,
            Err(e) => {
                stack.unregister_transport_endpoint(&udp_registration, &udp_endpoint);
                udp_endpoint.close();
                return Err(DnsServiceError::registration(TransportProtocol::Tcp, e));
            }
        };
        let tcp_listener = listener.handle();
        let accept_task = shared.runtime.spawn(accept_loop(Arc::clone(&shared), listener));

        debug!(listen = %addr, "DNS service registered");
        Ok(Some(Self {
            listen: addr,
            stack: stack.clone(),
            shared,
            udp_registration,
            udp_endpoint,
            tcp_listener,
            accept_task: Mutex::new(Some(accept_task)),
            stopped: AtomicBool::new(false),
        }))
    }

    /// Withdraw both registrations
    ///
    /// Flows already being served are left alone and end at their own read
    /// deadline. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shared.withdraw();
        self.stack
            .unregister_transport_endpoint(&self.udp_registration, &self.udp_endpoint);
        self.tcp_listener.close();
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }

        info!(
            listen = %self.listen,
            active_flows = self.shared.active.len(),
            stats = ?self.shared.stats.snapshot(),
            "DNS service stopped"
        );
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Bound listen address
    pub fn listen_address(&self) -> SocketAddr {
        self.listen
    }

    /// Number of flows currently being served
    pub fn active_flow_count(&self) -> usize {
        self.shared.active.len()
    }

    /// Copy of the active-flow table
    pub fn active_flows(&self) -> Vec<ActiveFlow> {
        self.shared.active.iter().map(|e| e.value().clone()).collect()
    }

    pub fn stats(&self) -> DnsServiceStatsSnapshot {
        self.shared.stats.snapshot()
    }
}

impl Drop for DnsInterceptService {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for DnsInterceptService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsInterceptService")
            .field("listen", &self.listen)
            .field("stopped", &self.is_stopped())
            .field("active_flows", &self.active_flow_count())
            .finish_non_exhaustive()
    }
}
