//! Endpoint table behaviour seen through the public API

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use tun_intercept::dns::{self, DnsInterceptService, DnsServiceConfig, DnsServiceError};
use tun_intercept::stack::{
    ControlType, DatagramPipe, EndpointId, EndpointRegistration, Flow, FlowId, NetStack, NetworkProtocol,
    StackError, TransportEndpoint, TransportProtocol,
};

use super::common::{
    a_query, answer_for, ipv4_tcp_syn, ipv4_udp, sa, IdEchoResolver, ParsedPacket, IPPROTO_TCP, IPPROTO_UDP,
};

const WAIT: Duration = Duration::from_secs(2);

/// Next packet the stack writes back onto the link
async fn next_packet(wire: &mut DatagramPipe) -> ParsedPacket {
    let mut buf = vec![0u8; 2048];
    let n = tokio::time::timeout(WAIT, wire.read(&mut buf))
        .await
        .expect("no packet from the stack")
        .unwrap();
    ParsedPacket::parse(&buf[..n])
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

/// Claims every flow and keeps its I/O open
#[derive(Default)]
struct HoldingEndpoint {
    held: parking_lot::Mutex<Vec<Flow>>,
    controls: AtomicUsize,
    closed: CancellationToken,
}

#[async_trait]
impl TransportEndpoint for HoldingEndpoint {
    fn handle_flow(&self, flow: Flow) -> Result<(), Flow> {
        self.held.lock().push(flow);
        Ok(())
    }

    fn handle_control(&self, _control: ControlType, _id: FlowId) {
        self.controls.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&self) {
        self.closed.cancel();
    }

    async fn wait(&self) {
        self.closed.cancelled().await;
    }
}

fn udp_flow(local: &str) -> Flow {
    let (_client, server) = DatagramPipe::pair(4);
    Flow::udp(FlowId::new(sa(local), sa("10.0.0.7:40000")), server)
}

#[test]
fn test_exact_and_wildcard_registrations_conflict() {
    let stack = NetStack::default();
    let exact = EndpointRegistration::for_id(TransportProtocol::Udp, EndpointId::new(sa("198.18.0.2:53")));
    stack
        .register_transport_endpoint(exact, Arc::new(HoldingEndpoint::default()))
        .unwrap();

    let wildcard = EndpointRegistration::for_id(TransportProtocol::Udp, EndpointId::new(sa("0.0.0.0:53")));
    let err = stack
        .register_transport_endpoint(wildcard, Arc::new(HoldingEndpoint::default()))
        .unwrap_err();
    assert!(matches!(err, StackError::PortInUse { transport: TransportProtocol::Udp, .. }));

    // same port on the other transport is independent
    let tcp = EndpointRegistration::for_id(TransportProtocol::Tcp, EndpointId::new(sa("0.0.0.0:53")));
    stack
        .register_transport_endpoint(tcp, Arc::new(HoldingEndpoint::default()))
        .unwrap();
    assert_eq!(stack.endpoint_count(), 2);
}

#[tokio::test]
async fn test_dns_start_rolls_back_udp_when_tcp_taken() {
    let stack = NetStack::default();
    let _squatter = stack
        .listen_tcp(EndpointId::new(sa("198.18.0.2:53")), vec![NetworkProtocol::Ipv4])
        .unwrap();

    let err = DnsInterceptService::start(&stack, "198.18.0.2:53", Arc::new(IdEchoResolver), DnsServiceConfig::default())
        .unwrap_err();
    assert!(matches!(
        err,
        DnsServiceError::EndpointRegistrationFailed {
            transport: TransportProtocol::Tcp,
            ..
        }
    ));
    // only the squatter remains; the UDP side was withdrawn
    assert_eq!(stack.endpoint_count(), 1);
    assert!(stack.deliver(udp_flow("198.18.0.2:53")).is_err());
}

#[tokio::test]
async fn test_dns_start_fails_when_udp_taken() {
    let stack = NetStack::default();
    let owner = Arc::new(HoldingEndpoint::default());
    let reg = EndpointRegistration::for_id(TransportProtocol::Udp, EndpointId::new(sa("198.18.0.2:53")));
    stack.register_transport_endpoint(reg, owner.clone()).unwrap();

    let err = DnsInterceptService::start(&stack, "198.18.0.2:53", Arc::new(IdEchoResolver), DnsServiceConfig::default())
        .unwrap_err();
    assert!(matches!(
        err,
        DnsServiceError::EndpointRegistrationFailed {
            transport: TransportProtocol::Udp,
            ..
        }
    ));
    assert_eq!(stack.endpoint_count(), 1);

    // the original owner still gets its flows
    assert!(stack.deliver(udp_flow("198.18.0.2:53")).is_ok());
    assert_eq!(owner.held.lock().len(), 1);
}

#[tokio::test]
async fn test_declined_flow_returned_to_caller() {
    let stack = NetStack::default();
    let mut unclaimed = stack.take_unclaimed().unwrap();
    let _service =
        DnsInterceptService::start(&stack, "198.18.0.2:53", Arc::new(IdEchoResolver), DnsServiceConfig::default())
            .unwrap()
            .unwrap();

    // deliver() hands declined flows back; a proxy layer would take them
    // from the unclaimed channel instead
    let flow = stack.deliver(udp_flow("93.184.216.34:443")).unwrap_err();
    assert_eq!(flow.id().local, sa("93.184.216.34:443"));
    assert!(unclaimed.try_recv().is_err());
}

#[tokio::test]
async fn test_claimed_tcp_flow_keeps_bytes_flowing() {
    let stack = NetStack::default();
    let mut listener = stack
        .listen_tcp(EndpointId::new(sa("10.0.0.1:8080")), vec![NetworkProtocol::Ipv4])
        .unwrap();

    let (mut client, server) = tokio::io::duplex(64);
    assert!(stack
        .deliver(Flow::tcp(FlowId::new(sa("10.0.0.1:8080"), sa("10.0.0.2:50000")), server))
        .is_ok());

    let accepted = listener.accept().await.unwrap();
    assert_eq!(accepted.protocol(), TransportProtocol::Tcp);
    assert_eq!(accepted.id().remote, sa("10.0.0.2:50000"));

    let mut io = accepted.into_io();
    io.write_all(b"pong").await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");
}

#[tokio::test]
async fn test_control_routed_by_local_address() {
    let stack = NetStack::default();
    let endpoint = Arc::new(HoldingEndpoint::default());
    let reg = EndpointRegistration::for_id(TransportProtocol::Udp, EndpointId::new(sa("0.0.0.0:53")));
    stack.register_transport_endpoint(reg, endpoint.clone()).unwrap();

    let id = FlowId::new(sa("198.18.0.2:53"), sa("10.0.0.7:40000"));
    assert!(stack.deliver_control(TransportProtocol::Udp, ControlType::PortUnreachable, id));
    let elsewhere = FlowId::new(sa("198.18.0.2:54"), sa("10.0.0.7:40000"));
    assert!(!stack.deliver_control(TransportProtocol::Udp, ControlType::PortUnreachable, elsewhere));
    assert_eq!(endpoint.controls.load(Ordering::SeqCst), 1);
    assert_eq!(stack.stats().control_delivered, 1);
}

#[tokio::test]
async fn test_stop_closes_every_endpoint() {
    let stack = NetStack::default();
    let endpoint = Arc::new(HoldingEndpoint::default());
    let reg = EndpointRegistration::for_id(TransportProtocol::Udp, EndpointId::new(sa("127.0.0.1:9")));
    stack.register_transport_endpoint(reg, endpoint.clone()).unwrap();

    stack.stop();
    endpoint.wait().await;
    assert_eq!(stack.endpoint_count(), 0);
    assert!(!stack.is_running());
}

#[tokio::test]
async fn test_udp_query_through_attached_link() {
    let stack = NetStack::default();
    let (link, mut wire) = DatagramPipe::pair(64);
    stack.attach(link, 1500).unwrap();
    let service =
        DnsInterceptService::start(&stack, "198.18.0.2:53", Arc::new(IdEchoResolver), DnsServiceConfig::default())
            .unwrap()
            .unwrap();

    let client = sa("10.0.0.2:40000");
    for id in [0x4242, 0x4243] {
        let query = a_query(id, "example.com.");
        let packet = ipv4_udp(client, sa("198.18.0.2:53"), &dns::encode(&query).unwrap());
        wire.write_all(&packet).await.unwrap();

        let reply = next_packet(&mut wire).await;
        assert_eq!(reply.protocol, IPPROTO_UDP);
        assert_eq!(reply.src, sa("198.18.0.2:53"));
        assert_eq!(reply.dst, client);
        assert_eq!(reply.udp_payload(), dns::encode(&answer_for(&query)).unwrap());
    }

    // both datagrams share one 5-tuple, hence one flow
    assert_eq!(stack.stats().udp_flows, 1);
    assert_eq!(stack.stats().flows_claimed, 1);
    let flows = service.active_flows();
    assert_eq!(flows.len(), 1);
    assert_eq!(flows[0].id, FlowId::new(sa("198.18.0.2:53"), client));

    // another port on the same address is not ours
    let other = ipv4_udp(client, sa("198.18.0.2:5353"), b"not for dns");
    wire.write_all(&other).await.unwrap();
    eventually(|| stack.stats().flows_dropped == 1).await;
    assert_eq!(service.stats().udp_flows, 1);

    stack.stop();
}

#[tokio::test]
async fn test_tcp_syn_through_attached_link() {
    let stack = NetStack::default();
    let (link, mut wire) = DatagramPipe::pair(64);
    stack.attach(link, 1500).unwrap();
    let service =
        DnsInterceptService::start(&stack, "198.18.0.2:53", Arc::new(IdEchoResolver), DnsServiceConfig::default())
            .unwrap()
            .unwrap();

    let client = sa("10.0.0.3:41000");
    wire.write_all(&ipv4_tcp_syn(client, sa("198.18.0.2:53"), 1000))
        .await
        .unwrap();

    let syn_ack = next_packet(&mut wire).await;
    assert_eq!(syn_ack.protocol, IPPROTO_TCP);
    assert_eq!(syn_ack.src, sa("198.18.0.2:53"));
    assert_eq!(syn_ack.dst, client);
    assert_eq!(syn_ack.tcp_flags() & 0x12, 0x12);

    eventually(|| service.stats().tcp_flows == 1).await;
    let flows = service.active_flows();
    assert_eq!(flows.len(), 1);
    assert_eq!(flows[0].protocol, TransportProtocol::Tcp);
    assert_eq!(flows[0].id, FlowId::new(sa("198.18.0.2:53"), client));

    stack.stop();
}
