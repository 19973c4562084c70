//! TCP listener on top of the endpoint table

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::endpoint::{EndpointId, EndpointRegistration, TransportEndpoint, TransportProtocol};
use super::error::{StackError, StackResult};
use super::flow::Flow;
use super::StackInner;

/// Endpoint that queues accepted TCP flows for a [`TcpListener`]
pub(crate) struct ListenerEndpoint {
    tx: mpsc::Sender<Flow>,
    closed: CancellationToken,
}

#[async_trait]
impl TransportEndpoint for ListenerEndpoint {
    fn handle_flow(&self, flow: Flow) -> Result<(), Flow> {
        if flow.protocol() != TransportProtocol::Tcp || self.closed.is_cancelled() {
            return Err(flow);
        }
        self.tx.try_send(flow).map_err(|e| match e {
            TrySendError::Full(flow) => {
                trace!(id = %flow.id(), "Listener backlog full");
                flow
            }
            TrySendError::Closed(flow) => flow,
        })
    }

    fn close(&self) {
        self.closed.cancel();
    }

    async fn wait(&self) {
        self.closed.cancelled().await;
    }
}

/// Cloneable handle that closes a [`TcpListener`] from another task
#[derive(Clone)]
pub struct ListenerHandle {
    registration: EndpointRegistration,
    endpoint: Arc<dyn TransportEndpoint>,
    stack: Weak<StackInner>,
}

impl ListenerHandle {
    /// Withdraw the registration and wake any pending `accept`
    ///
    /// Idempotent.
    pub fn close(&self) {
        if let Some(stack) = self.stack.upgrade() {
            stack.unregister(&self.registration, &self.endpoint);
        }
        self.endpoint.close();
    }

    pub fn local(&self) -> EndpointId {
        self.registration.id
    }
}

/// Accepts TCP flows addressed to one endpoint identity
pub struct TcpListener {
    rx: mpsc::Receiver<Flow>,
    closed: CancellationToken,
    handle: ListenerHandle,
}

impl TcpListener {
    pub(crate) fn new(
        registration: EndpointRegistration,
        backlog: usize,
        stack: Weak<StackInner>,
    ) -> (Self, Arc<dyn TransportEndpoint>) {
        let (tx, rx) = mpsc::channel(backlog.max(1));
        let closed = CancellationToken::new();
        let endpoint: Arc<dyn TransportEndpoint> = Arc::new(ListenerEndpoint {
            tx,
            closed: closed.clone(),
        });
        let listener = Self {
            rx,
            closed,
            handle: ListenerHandle {
                registration,
                endpoint: Arc::clone(&endpoint),
                stack,
            },
        };
        (listener, endpoint)
    }

    /// Next accepted connection
    ///
    /// # Errors
    ///
    /// `ListenerClosed` once the listener (or its stack) has been closed.
    pub async fn accept(&mut self) -> StackResult<Flow> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(StackError::ListenerClosed),
            flow = self.rx.recv() => flow.ok_or(StackError::ListenerClosed),
        }
    }

    pub fn local(&self) -> EndpointId {
        self.handle.local()
    }

    pub fn handle(&self) -> ListenerHandle {
        self.handle.clone()
    }

    pub fn close(&self) {
        self.handle.close();
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        self.handle.close();
    }
}
