//! End-to-end exchanges between two transport instances over the in-memory
//! network: full request/response lifecycles, grant-driven long messages,
//! acknowledgment flow, aborts and teardown accounting.

mod support;

use std::net::SocketAddr;

use homa_mamont::protocol::BPAGE_SIZE;
use homa_mamont::wire::{common_hdr, encode, packet_type, rpc_unknown_hdr};
use homa_mamont::{Config, HomaError, RecvFilter};

use support::{patterned, pump, test_config, TestNode};

const SERVER_PORT: u16 = 77;

fn pair() -> (TestNode, TestNode) {
    (TestNode::new(1, test_config()), TestNode::new(2, test_config()))
}

fn pair_with(config: Config) -> (TestNode, TestNode) {
    (TestNode::new(1, config.clone()), TestNode::new(2, config))
}

#[test]
fn small_request_and_response_complete() {
    let (client_node, server_node) = pair();
    let client = client_node.homa.bind(0).expect("bind client");
    client.set_buffer_region(4 * BPAGE_SIZE).expect("client region");
    let server = server_node.homa.bind(SERVER_PORT).expect("bind server");
    server.set_buffer_region(4 * BPAGE_SIZE).expect("server region");

    let request = patterned(100);
    let id = client
        .send_request(server_node.port_addr(SERVER_PORT), &request, 0xfeed)
        .expect("send request");
    pump(&[&client_node, &server_node]);

    // Server sees the request and answers.
    let req = server
        .try_receive(RecvFilter::Request)
        .expect("server receive")
        .expect("request delivered");
    assert_eq!(req.length, 100);
    assert_eq!(server.message_bytes(&req).expect("read request"), request);
    server.release_bpages(&req.bpages).expect("release request");

    let response = patterned(200);
    server.send_response(req.source, req.id, &response).expect("send response");
    pump(&[&client_node, &server_node]);

    // Client observes the response with its cookie; no gaps ever existed.
    let resp = client
        .try_receive(RecvFilter::Response)
        .expect("client receive")
        .expect("response delivered");
    assert_eq!(resp.id, id);
    assert_eq!(resp.cookie, 0xfeed);
    assert_eq!(resp.error, None);
    assert_eq!(client.message_bytes(&resp).expect("read response"), response);
    client.release_bpages(&resp.bpages).expect("release response");

    // Delivery finished the client RPC.
    assert_eq!(client.active_rpcs(), 0);
}

#[test]
fn need_ack_roundtrip_retires_the_server_rpc() {
    let (client_node, server_node) = pair();
    let client = client_node.homa.bind(0).expect("bind client");
    client.set_buffer_region(4 * BPAGE_SIZE).expect("client region");
    let server = server_node.homa.bind(SERVER_PORT).expect("bind server");
    server.set_buffer_region(4 * BPAGE_SIZE).expect("server region");

    client.send_request(server_node.port_addr(SERVER_PORT), b"ping", 0).expect("send");
    pump(&[&client_node, &server_node]);
    let req = server.try_receive(RecvFilter::Request).expect("recv").expect("request");
    server.release_bpages(&req.bpages).expect("release");
    server.send_response(req.source, req.id, b"pong").expect("respond");
    pump(&[&client_node, &server_node]);
    let resp = client.try_receive(RecvFilter::Response).expect("recv").expect("response");
    client.release_bpages(&resp.bpages).expect("release");
    assert_eq!(server.active_rpcs(), 1, "server still awaits an acknowledgment");

    // The server's timer asks for an ack; the (already finished) client
    // answers from its pending-ack queue and the server RPC retires.
    for _ in 0..4 {
        server_node.homa.tick();
        pump(&[&client_node, &server_node]);
    }
    assert_eq!(server.active_rpcs(), 0);
    assert!(server_node.homa.metrics().need_acks_sent >= 1);
    assert!(client_node.homa.metrics().acks_sent >= 1);
}

#[test]
fn long_messages_flow_through_grants() {
    // Response far beyond the unscheduled allowance: it only completes if
    // GRANT/DATA exchange works end to end.
    let config = Config {
        unsched_bytes: 2_000,
        grant_window: 4_000,
        ..test_config()
    };
    let (client_node, server_node) = pair_with(config);
    let client = client_node.homa.bind(0).expect("bind client");
    client.set_buffer_region(16 * BPAGE_SIZE).expect("client region");
    let server = server_node.homa.bind(SERVER_PORT).expect("bind server");
    server.set_buffer_region(16 * BPAGE_SIZE).expect("server region");

    let request = patterned(50_000);
    let response = patterned(120_000);
    client.send_request(server_node.port_addr(SERVER_PORT), &request, 1).expect("send");
    pump(&[&client_node, &server_node]);

    let req = server.try_receive(RecvFilter::Request).expect("recv").expect("request");
    assert_eq!(server.message_bytes(&req).expect("read"), request);
    server.release_bpages(&req.bpages).expect("release");
    server.send_response(req.source, req.id, &response).expect("respond");
    pump(&[&client_node, &server_node]);

    let resp = client.try_receive(RecvFilter::Response).expect("recv").expect("response");
    assert_eq!(resp.length, 120_000);
    assert_eq!(client.message_bytes(&resp).expect("read"), response);
    client.release_bpages(&resp.bpages).expect("release");

    assert!(server_node.homa.metrics().grants_sent >= 1, "request needed grants");
    assert!(client_node.homa.metrics().grants_sent >= 1, "response needed grants");
}

#[test]
fn reordered_delivery_still_assembles() {
    let (client_node, server_node) = pair();
    let client = client_node.homa.bind(0).expect("bind client");
    client.set_buffer_region(4 * BPAGE_SIZE).expect("client region");
    let server = server_node.homa.bind(SERVER_PORT).expect("bind server");
    server.set_buffer_region(4 * BPAGE_SIZE).expect("server region");

    let request = patterned(8_000);
    client.send_request(server_node.port_addr(SERVER_PORT), &request, 0).expect("send");

    // Deliver the request's packets in reverse order.
    let mut packets = client_node.drain();
    packets.reverse();
    for d in packets {
        server_node.homa.ingest(client_node.addr, &d.bytes);
    }
    pump(&[&client_node, &server_node]);

    let req = server.try_receive(RecvFilter::Request).expect("recv").expect("request");
    assert_eq!(server.message_bytes(&req).expect("read"), request);
}

#[test]
fn abort_surfaces_canceled_to_the_waiter() {
    let (client_node, server_node) = pair();
    let client = client_node.homa.bind(0).expect("bind client");
    client.set_buffer_region(4 * BPAGE_SIZE).expect("client region");
    let server = server_node.homa.bind(SERVER_PORT).expect("bind server");
    server.set_buffer_region(4 * BPAGE_SIZE).expect("server region");

    let id = client
        .send_request(server_node.port_addr(SERVER_PORT), b"never mind", 9)
        .expect("send");
    client.abort(id).expect("abort");

    let msg = client.try_receive(RecvFilter::Any).expect("recv").expect("aborted delivered");
    assert_eq!(msg.id, id);
    assert_eq!(msg.cookie, 9);
    assert_eq!(msg.error, Some(HomaError::Canceled));
    assert_eq!(client.active_rpcs(), 0);
    // A second abort finds nothing: end() already ran.
    assert_eq!(client.abort(id), Err(HomaError::NoSuchRpc));
}

#[test]
fn rpc_unknown_fails_the_client_rpc() {
    let (client_node, server_node) = pair();
    let client = client_node.homa.bind(0).expect("bind client");
    client.set_buffer_region(4 * BPAGE_SIZE).expect("client region");

    let id = client
        .send_request(server_node.port_addr(SERVER_PORT), b"hello?", 0)
        .expect("send");
    client_node.drain();

    // The server claims no knowledge of the RPC.
    let unknown = rpc_unknown_hdr {
        common: common_hdr::new(
            packet_type::RPC_UNKNOWN,
            SERVER_PORT,
            client.port,
            id ^ 1,
            rpc_unknown_hdr::DOFF,
        ),
    };
    client_node.homa.ingest(server_node.addr, &encode(&unknown));

    let msg = client.try_receive(RecvFilter::Any).expect("recv").expect("failure delivered");
    assert_eq!(msg.id, id);
    assert_eq!(msg.error, Some(HomaError::RpcUnknown));
}

#[test]
fn shutdown_wakes_receivers_and_fails_calls() {
    let (client_node, server_node) = pair();
    let client = client_node.homa.bind(0).expect("bind client");
    client.set_buffer_region(4 * BPAGE_SIZE).expect("client region");
    client.send_request(server_node.port_addr(SERVER_PORT), b"in flight", 0).expect("send");

    client.shutdown();
    assert!(client.is_shutdown());
    assert!(matches!(client.try_receive(RecvFilter::Any), Err(HomaError::Shutdown)));
    assert_eq!(
        client.send_request(server_node.port_addr(SERVER_PORT), b"late", 0),
        Err(HomaError::Shutdown)
    );
    assert_eq!(client.active_rpcs(), 0);
}

#[test]
fn teardown_balances_every_resource() {
    let (client_node, server_node) = pair();
    let client = client_node.homa.bind(0).expect("bind client");
    client.set_buffer_region(4 * BPAGE_SIZE).expect("client region");
    let server = server_node.homa.bind(SERVER_PORT).expect("bind server");
    server.set_buffer_region(4 * BPAGE_SIZE).expect("server region");

    // A few full exchanges.
    for i in 0..3u64 {
        client
            .send_request(server_node.port_addr(SERVER_PORT), &patterned(3_000), i)
            .expect("send");
        pump(&[&client_node, &server_node]);
        let req = server.try_receive(RecvFilter::Request).expect("recv").expect("request");
        server.release_bpages(&req.bpages).expect("release");
        server.send_response(req.source, req.id, &patterned(500)).expect("respond");
        pump(&[&client_node, &server_node]);
        let resp = client.try_receive(RecvFilter::Response).expect("recv").expect("response");
        client.release_bpages(&resp.bpages).expect("release");
    }
    // Let acknowledgments retire the server RPCs.
    for _ in 0..4 {
        server_node.homa.tick();
        pump(&[&client_node, &server_node]);
    }

    let client_region = client.buffer_region().expect("region");
    let server_region = server.buffer_region().expect("region");

    client.destroy();
    server.destroy();
    assert_eq!(client.active_rpcs(), 0);
    assert_eq!(server.active_rpcs(), 0);
    assert_eq!(client.dead_skbs(), 0);
    assert_eq!(server.dead_skbs(), 0);
    assert_eq!(client_region.in_use(), 0, "every client bpage returned");
    assert_eq!(server_region.in_use(), 0, "every server bpage returned");
    assert_eq!(client_node.homa.socket_count(), 0);
    assert_eq!(server_node.homa.socket_count(), 0);

    // With no RPCs referencing them, the idle peers scavenge away.
    client_node.homa.tick();
    server_node.homa.tick();
    assert_eq!(client_node.homa.peers.len(), 0);
    assert_eq!(server_node.homa.peers.len(), 0);
}
