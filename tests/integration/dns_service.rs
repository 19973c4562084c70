//! DNS responder end-to-end over in-memory flows
//!
//! Flows are offered to the stack with `NetStack::deliver`, exactly as the
//! accept loop does for packets read from the device.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::timeout;

use tun_intercept::dns::{self, DnsInterceptService, DnsServiceConfig};
use tun_intercept::stack::{DatagramPipe, Flow, FlowId, NetStack};

use super::common::{a_query, answer_for, sa, IdEchoResolver, SilentResolver, StubResolver};

const WAIT: Duration = Duration::from_secs(2);

fn udp_client(stack: &NetStack, local: &str, remote: &str) -> DatagramPipe {
    let (client, server) = DatagramPipe::pair(16);
    let flow = Flow::udp(FlowId::new(sa(local), sa(remote)), server);
    assert!(stack.deliver(flow).is_ok(), "UDP flow to {local} not claimed");
    client
}

fn tcp_client(stack: &NetStack, local: &str, remote: &str) -> DuplexStream {
    let (client, server) = tokio::io::duplex(4096);
    let flow = Flow::tcp(FlowId::new(sa(local), sa(remote)), server);
    assert!(stack.deliver(flow).is_ok(), "TCP flow to {local} not claimed");
    client
}

async fn udp_exchange(client: &mut DatagramPipe, query: &Message) -> Vec<u8> {
    client.write_all(&dns::encode(query).unwrap()).await.unwrap();
    let mut buf = vec![0u8; 4096];
    let n = timeout(WAIT, client.read(&mut buf)).await.unwrap().unwrap();
    buf.truncate(n);
    buf
}

async fn tcp_send(client: &mut DuplexStream, query: &Message) {
    let framed = dns::Framing::LengthPrefixed
        .frame(&dns::encode(query).unwrap())
        .unwrap();
    client.write_all(&framed).await.unwrap();
}

async fn tcp_recv(client: &mut DuplexStream) -> Vec<u8> {
    let mut len = [0u8; 2];
    timeout(WAIT, client.read_exact(&mut len)).await.unwrap().unwrap();
    let mut body = vec![0u8; u16::from_be_bytes(len) as usize];
    client.read_exact(&mut body).await.unwrap();
    body
}

/// Waits until the server side of a flow is gone
async fn expect_eof<R: AsyncRead + Unpin>(client: &mut R) {
    let mut buf = [0u8; 512];
    let n = timeout(WAIT, client.read(&mut buf)).await.unwrap().unwrap_or(0);
    assert_eq!(n, 0, "flow still open");
}

#[tokio::test]
async fn test_stub_resolver_answer_is_byte_exact() {
    let stack = NetStack::default();
    let stub = StubResolver::new(Ipv4Addr::new(93, 184, 216, 34));
    let service = DnsInterceptService::start(&stack, "127.0.0.1:53", stub.clone(), DnsServiceConfig::default())
        .unwrap()
        .unwrap();

    let mut client = udp_client(&stack, "127.0.0.1:53", "127.0.0.1:41000");
    let reply = udp_exchange(&mut client, &a_query(0xbeef, "example.com.")).await;
    assert_eq!(reply, stub.bytes_for(0xbeef));

    let decoded = dns::decode(&reply).unwrap();
    assert_eq!(decoded.answers().len(), 1);
    assert_eq!(service.stats().responses_written, 1);
}

#[tokio::test]
async fn test_port_zero_disables_service() {
    let stack = NetStack::default();
    for listen in ["127.0.0.1:0", "", ":0", "[::1]:0"] {
        let service =
            DnsInterceptService::start(&stack, listen, Arc::new(IdEchoResolver), DnsServiceConfig::default()).unwrap();
        assert!(service.is_none(), "{listen:?} should disable the service");
    }
    assert_eq!(stack.endpoint_count(), 0);
    assert_eq!(dns::format_listen(None), "");
}

#[tokio::test]
async fn test_concurrent_flows_stay_isolated() {
    let stack = NetStack::default();
    let service =
        DnsInterceptService::start(&stack, "198.18.0.2:53", Arc::new(IdEchoResolver), DnsServiceConfig::default())
            .unwrap()
            .unwrap();

    let mut tasks = Vec::new();
    for client_no in 0..8u16 {
        let remote = format!("10.0.0.{}:{}", client_no + 1, 40000 + client_no);
        let mut udp = udp_client(&stack, "198.18.0.2:53", &remote);
        let mut tcp = tcp_client(&stack, "198.18.0.2:53", &remote);

        tasks.push(tokio::spawn(async move {
            for seq in 0..16u16 {
                let id = client_no * 256 + seq;

                let query = a_query(id, "udp.example.");
                let reply = udp_exchange(&mut udp, &query).await;
                assert_eq!(reply, dns::encode(&answer_for(&query)).unwrap());

                let query = a_query(id, "tcp.example.");
                tcp_send(&mut tcp, &query).await;
                assert_eq!(tcp_recv(&mut tcp).await, dns::encode(&answer_for(&query)).unwrap());
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let stats = service.stats();
    assert_eq!(stats.udp_flows, 8);
    assert_eq!(stats.tcp_flows, 8);
    assert_eq!(stats.queries_received, 8 * 16 * 2);
    assert_eq!(stats.responses_written, 8 * 16 * 2);
    assert_eq!(stats.write_errors, 0);
}

#[tokio::test]
async fn test_pipelined_tcp_queries_all_answered() {
    let stack = NetStack::default();
    let _service =
        DnsInterceptService::start(&stack, "198.18.0.2:53", Arc::new(IdEchoResolver), DnsServiceConfig::default())
            .unwrap()
            .unwrap();

    let mut tcp = tcp_client(&stack, "198.18.0.2:53", "10.0.0.9:50000");
    for id in 1..=5u16 {
        tcp_send(&mut tcp, &a_query(id, "pipelined.example.")).await;
    }

    // handlers run concurrently, so replies may arrive in any order
    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(dns::decode(&tcp_recv(&mut tcp).await).unwrap().id());
    }
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
}

#[tokio::test(start_paused = true)]
async fn test_idle_flow_closed_other_flow_unaffected() {
    let stack = NetStack::default();
    let config = DnsServiceConfig {
        read_timeout: Duration::from_millis(200),
        ..DnsServiceConfig::default()
    };
    let service = DnsInterceptService::start(&stack, "198.18.0.2:53", Arc::new(IdEchoResolver), config)
        .unwrap()
        .unwrap();

    let mut idle = tcp_client(&stack, "198.18.0.2:53", "10.0.0.1:40001");
    let mut busy = udp_client(&stack, "198.18.0.2:53", "10.0.0.2:40002");

    // keep the busy flow under its deadline while the idle one expires
    for id in 0..6u16 {
        let query = a_query(id, "busy.example.");
        assert_eq!(
            udp_exchange(&mut busy, &query).await,
            dns::encode(&answer_for(&query)).unwrap()
        );
        tokio::time::sleep(Duration::from_millis(60)).await;
    }

    expect_eof(&mut idle).await;
    assert_eq!(service.stats().flows_timed_out, 1);

    let query = a_query(99, "busy.example.");
    assert_eq!(
        udp_exchange(&mut busy, &query).await,
        dns::encode(&answer_for(&query)).unwrap()
    );
}

#[tokio::test(start_paused = true)]
async fn test_stop_leaves_open_flow_until_deadline() {
    let stack = NetStack::default();
    let config = DnsServiceConfig {
        read_timeout: Duration::from_millis(300),
        ..DnsServiceConfig::default()
    };
    let service = DnsInterceptService::start(&stack, "198.18.0.2:53", Arc::new(IdEchoResolver), config.clone())
        .unwrap()
        .unwrap();
    let mut open = udp_client(&stack, "198.18.0.2:53", "10.0.0.1:40000");
    assert_eq!(stack.endpoint_count(), 2);

    service.stop();
    service.stop();
    assert!(service.is_stopped());
    assert_eq!(stack.endpoint_count(), 0);

    // new flows are no longer claimed
    let (_client, server) = DatagramPipe::pair(4);
    let flow = Flow::udp(FlowId::new(sa("198.18.0.2:53"), sa("10.0.0.1:40001")), server);
    assert!(stack.deliver(flow).is_err());

    // the flow already being served keeps answering
    let query = a_query(21, "after.stop.");
    assert_eq!(
        udp_exchange(&mut open, &query).await,
        dns::encode(&answer_for(&query)).unwrap()
    );
    assert_eq!(service.active_flows().len(), 1);

    // until its own read deadline passes
    expect_eof(&mut open).await;
    assert_eq!(service.stats().flows_timed_out, 1);
    assert!(service.active_flows().is_empty());

    // and the address can be taken again
    let again = DnsInterceptService::start(&stack, "198.18.0.2:53", Arc::new(SilentResolver), config).unwrap();
    assert!(again.is_some());
}

#[tokio::test]
async fn test_empty_datagram_keeps_flow_open() {
    let stack = NetStack::default();
    let service =
        DnsInterceptService::start(&stack, "198.18.0.2:53", Arc::new(IdEchoResolver), DnsServiceConfig::default())
            .unwrap()
            .unwrap();

    let mut client = udp_client(&stack, "198.18.0.2:53", "10.0.0.1:40000");
    assert_eq!(client.write(&[]).await.unwrap(), 0);

    let query = a_query(4, "after.empty.");
    assert_eq!(
        udp_exchange(&mut client, &query).await,
        dns::encode(&answer_for(&query)).unwrap()
    );
    let stats = service.stats();
    assert_eq!(stats.decode_errors, 1);
    assert_eq!(stats.read_errors, 0);
    assert_eq!(service.active_flows().len(), 1);
}

#[tokio::test]
async fn test_wildcard_listen_claims_any_local_address() {
    let stack = NetStack::default();
    let service = DnsInterceptService::start(&stack, ":53", Arc::new(IdEchoResolver), DnsServiceConfig::default())
        .unwrap()
        .unwrap();
    assert_eq!(service.listen_address(), sa("0.0.0.0:53"));

    for local in ["198.18.0.2:53", "10.1.2.3:53"] {
        let mut client = udp_client(&stack, local, "10.0.0.5:45000");
        let query = a_query(7, "any.example.");
        assert_eq!(
            udp_exchange(&mut client, &query).await,
            dns::encode(&answer_for(&query)).unwrap()
        );
    }

    // other ports are left alone
    let (_client, server) = DatagramPipe::pair(4);
    let flow = Flow::udp(FlowId::new(sa("198.18.0.2:5353"), sa("10.0.0.5:45000")), server);
    assert!(stack.deliver(flow).is_err());
}

#[tokio::test]
async fn test_garbage_then_valid_query_on_udp() {
    let stack = NetStack::default();
    let service =
        DnsInterceptService::start(&stack, "198.18.0.2:53", Arc::new(IdEchoResolver), DnsServiceConfig::default())
            .unwrap()
            .unwrap();

    let mut client = udp_client(&stack, "198.18.0.2:53", "10.0.0.1:40000");
    client.write_all(b"\x01\x02 not dns").await.unwrap();

    let query = a_query(3, "after.garbage.");
    assert_eq!(
        udp_exchange(&mut client, &query).await,
        dns::encode(&answer_for(&query)).unwrap()
    );
    assert_eq!(service.stats().decode_errors, 1);
}
