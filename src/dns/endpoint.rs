//! UDP side of the DNS service as a stack endpoint

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::service::ServiceShared;
use super::stats::DnsServiceStats;
use crate::stack::{ControlType, EndpointId, Flow, FlowId, TransportEndpoint, TransportProtocol};

/// Claims UDP flows addressed to the service's identity
pub(crate) struct DnsUdpEndpoint {
    id: EndpointId,
    shared: Arc<ServiceShared>,
}

impl DnsUdpEndpoint {
    pub(crate) fn new(id: EndpointId, shared: Arc<ServiceShared>) -> Self {
        Self { id, shared }
    }
}

#[async_trait]
impl TransportEndpoint for DnsUdpEndpoint {
    fn handle_flow(&self, flow: Flow) -> Result<(), Flow> {
        if flow.protocol() != TransportProtocol::Udp
            || !self.id.matches(&flow.id().local)
            || !self.shared.is_accepting()
        {
            trace!(id = %flow.id(), "DNS endpoint declined flow");
            return Err(flow);
        }

        DnsServiceStats::incr(&self.shared.stats.udp_flows);
        self.shared.spawn_flow(flow);
        Ok(())
    }

    fn handle_control(&self, control: ControlType, id: FlowId) {
        DnsServiceStats::incr(&self.shared.stats.control_messages);
        debug!(%id, ?control, "DNS client unreachable");
    }

    fn close(&self) {
        self.shared.shutdown();
    }

    async fn wait(&self) {
        self.shared.wait_shutdown().await;
    }
}
