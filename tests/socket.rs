//! Socket-level behavior: port allocation, argument validation, receive
//! filters, acknowledgment batching, the cutoff-version exchange, grant-
//! driven retransmission and multi-bpage delivery.

mod support;

use std::net::SocketAddr;

use homa_mamont::protocol::{BPAGE_SIZE, MAX_PENDING_ACKS};
use homa_mamont::wire::{common_hdr, encode, grant_hdr, packet_type, Packet};
use homa_mamont::{HomaError, RecvFilter};

use support::{patterned, pump, test_config, TestNode};

const SERVER_PORT: u16 = 77;

#[test]
fn ephemeral_ports_allocate_above_the_boundary() {
    let node = TestNode::new(1, test_config());
    let boundary = node.homa.config.min_default_port;

    let a = node.homa.bind(0).expect("first ephemeral");
    let b = node.homa.bind(0).expect("second ephemeral");
    assert!(a.port >= boundary);
    assert!(b.port >= boundary);
    assert_ne!(a.port, b.port);

    // Server ports live below the boundary and cannot collide.
    let srv = node.homa.bind(99).expect("server port");
    assert_eq!(srv.port, 99);
    assert_eq!(node.homa.bind(99).err(), Some(HomaError::PortInUse));
    assert_eq!(node.homa.bind(boundary).err(), Some(HomaError::InvalidPort));

    // A destroyed socket's port becomes bindable again.
    srv.destroy();
    node.homa.bind(99).expect("rebind after destroy");
}

#[test]
fn send_arguments_are_validated() {
    let node = TestNode::new(1, test_config());
    let hsk = node.homa.bind(0).expect("bind");
    let dest: SocketAddr = node.port_addr(SERVER_PORT);

    assert_eq!(hsk.send_request(dest, b"", 0).err(), Some(HomaError::InvalidMessage));
    let huge = vec![0u8; node.homa.config.max_message_length as usize + 1];
    assert_eq!(hsk.send_request(dest, &huge, 0).err(), Some(HomaError::InvalidMessage));

    // No server RPC with this id exists, let alone one awaiting a response.
    assert_eq!(hsk.send_response(dest, 3, b"hi").err(), Some(HomaError::NoSuchRpc));
}

#[test]
fn responding_twice_is_rejected() {
    let (client_node, server_node) =
        (TestNode::new(1, test_config()), TestNode::new(2, test_config()));
    let client = client_node.homa.bind(0).expect("bind client");
    client.set_buffer_region(4 * BPAGE_SIZE).expect("client region");
    let server = server_node.homa.bind(SERVER_PORT).expect("bind server");
    server.set_buffer_region(4 * BPAGE_SIZE).expect("server region");

    client.send_request(server_node.port_addr(SERVER_PORT), b"question", 0).expect("send");
    pump(&[&client_node, &server_node]);
    let req = server.try_receive(RecvFilter::Request).expect("recv").expect("request");
    server.send_response(req.source, req.id, b"answer").expect("first response");
    assert_eq!(
        server.send_response(req.source, req.id, b"answer again").err(),
        Some(HomaError::NoSuchRpc),
        "an RPC only ever carries one response"
    );
}

#[test]
fn receive_filters_select_by_kind_and_id() {
    let (client_node, server_node) =
        (TestNode::new(1, test_config()), TestNode::new(2, test_config()));
    let client = client_node.homa.bind(0).expect("bind client");
    client.set_buffer_region(4 * BPAGE_SIZE).expect("client region");
    let server = server_node.homa.bind(SERVER_PORT).expect("bind server");
    server.set_buffer_region(4 * BPAGE_SIZE).expect("server region");

    let id1 = client.send_request(server_node.port_addr(SERVER_PORT), b"one", 1).expect("send");
    let id2 = client.send_request(server_node.port_addr(SERVER_PORT), b"two", 2).expect("send");
    pump(&[&client_node, &server_node]);

    // The client has no requests, only (eventually) responses.
    assert!(client.try_receive(RecvFilter::Request).expect("recv").is_none());

    for _ in 0..2 {
        let req = server.try_receive(RecvFilter::Request).expect("recv").expect("request");
        let body = server.message_bytes(&req).expect("read");
        server.release_bpages(&req.bpages).expect("release");
        server.send_response(req.source, req.id, &body).expect("respond");
    }
    pump(&[&client_node, &server_node]);

    // Waiting on a specific RPC skips the other completed response.
    let second = client.try_receive(RecvFilter::Rpc(id2)).expect("recv").expect("id2 done");
    assert_eq!(second.cookie, 2);
    client.release_bpages(&second.bpages).expect("release");
    let first = client.try_receive(RecvFilter::Response).expect("recv").expect("id1 done");
    assert_eq!(first.id, id1);
    client.release_bpages(&first.bpages).expect("release");
    assert!(client.try_receive(RecvFilter::Any).expect("recv").is_none());
}

#[test]
fn full_ack_fifo_flushes_an_explicit_ack() {
    let (client_node, server_node) =
        (TestNode::new(1, test_config()), TestNode::new(2, test_config()));
    let client = client_node.homa.bind(0).expect("bind client");
    client.set_buffer_region(8 * BPAGE_SIZE).expect("client region");
    let server = server_node.homa.bind(SERVER_PORT).expect("bind server");
    server.set_buffer_region(8 * BPAGE_SIZE).expect("server region");

    // Enough completed client RPCs to fill the pending-ack FIFO.
    for i in 0..MAX_PENDING_ACKS as u64 {
        client.send_request(server_node.port_addr(SERVER_PORT), b"work", i).expect("send");
        pump(&[&client_node, &server_node]);
        let req = server.try_receive(RecvFilter::Request).expect("recv").expect("request");
        server.release_bpages(&req.bpages).expect("release");
        server.send_response(req.source, req.id, b"done").expect("respond");
        pump(&[&client_node, &server_node]);
        let resp = client.try_receive(RecvFilter::Response).expect("recv").expect("response");
        client.release_bpages(&resp.bpages).expect("release");
    }

    // The final delivery overflowed the FIFO and shipped one ACK carrying
    // the whole batch; no NEED_ACK was ever needed.
    let drained = client_node.drain_parsed();
    let acks: Vec<usize> = drained
        .iter()
        .filter_map(|(_, p)| match p {
            Packet::Ack(a) => Some(a.acks.len()),
            _ => None,
        })
        .collect();
    assert_eq!(acks, vec![MAX_PENDING_ACKS]);
    assert_eq!(client_node.homa.metrics().acks_sent, 1);
    assert_eq!(server_node.homa.metrics().need_acks_sent, 0);

    // Hand the drained packets on; the flush retires every server RPC.
    assert_eq!(server.active_rpcs(), MAX_PENDING_ACKS);
    for (d, _) in drained {
        if d.dst == server_node.addr {
            server_node.homa.ingest(client_node.addr, &d.bytes);
        }
    }
    assert_eq!(server.active_rpcs(), 0);
}

#[test]
fn cutoffs_propagate_after_the_first_exchange() {
    let (client_node, server_node) =
        (TestNode::new(1, test_config()), TestNode::new(2, test_config()));
    let client = client_node.homa.bind(0).expect("bind client");
    client.set_buffer_region(4 * BPAGE_SIZE).expect("client region");
    let server = server_node.homa.bind(SERVER_PORT).expect("bind server");
    server.set_buffer_region(4 * BPAGE_SIZE).expect("server region");

    // First contact: the client has never heard the server's cutoff table
    // (version 0 on the wire), so the server publishes it once.
    client.send_request(server_node.port_addr(SERVER_PORT), b"first", 0).expect("send");
    pump(&[&client_node, &server_node]);
    assert_eq!(server_node.homa.metrics().cutoffs_sent, 1);

    // Second request: the client now echoes the learned version and no
    // further CUTOFFS flows.
    client.send_request(server_node.port_addr(SERVER_PORT), b"second", 0).expect("send");
    let versions: Vec<u16> = client_node
        .drain_parsed()
        .iter()
        .filter_map(|(_, p)| match p {
            Packet::Data { hdr, .. } => Some(hdr.cutoff_version),
            _ => None,
        })
        .collect();
    assert_eq!(versions, vec![1]);
}

#[test]
fn grant_resend_all_retransmits_sent_data() {
    let node = TestNode::new(1, test_config());
    let hsk = node.homa.bind(0).expect("bind");
    let dest = node.port_addr(SERVER_PORT);
    let id = hsk.send_request(dest, &patterned(5000), 0).expect("send");
    let sent = node.drain_parsed().len();
    assert!(sent > 1);

    // The receiver lost its reassembly state and asks for everything again.
    let grant = grant_hdr {
        common: common_hdr::new(packet_type::GRANT, SERVER_PORT, hsk.port, id ^ 1, grant_hdr::DOFF),
        offset: 5000,
        priority: 3,
        resend_all: 1,
        pad: [0; 2],
    };
    node.homa.ingest(node.addr, &encode(&grant));

    let retransmits: Vec<(u32, u8)> = node
        .drain_parsed()
        .iter()
        .filter_map(|(d, p)| match p {
            Packet::Data { hdr, .. } if hdr.retransmit != 0 => Some((hdr.offset, d.priority)),
            _ => None,
        })
        .collect();
    assert_eq!(retransmits.len(), sent, "every transmitted segment repeated");
    // Retransmissions ride at the priority the grant named.
    assert!(retransmits.iter().all(|&(_, prio)| prio == 3));
}

#[test]
fn corrupted_packets_are_dropped_before_any_state_changes() {
    let node = TestNode::new(1, test_config());
    let hsk = node.homa.bind(SERVER_PORT).expect("bind");
    hsk.set_buffer_region(4 * BPAGE_SIZE).expect("region");

    let mut pkt = support::data_packet(0x8001, SERVER_PORT, 100, 100, 100, 0, &patterned(100));
    homa_mamont::wire::install_checksum(&mut pkt);
    let last = pkt.len() - 1;
    pkt[last] ^= 0x01;
    node.homa.ingest(node.addr, &pkt);

    assert_eq!(node.homa.metrics().malformed_packets, 1);
    assert_eq!(hsk.active_rpcs(), 0, "no RPC created from a corrupt packet");
    assert!(hsk.try_receive(RecvFilter::Any).expect("recv").is_none());

    // The intact packet goes through.
    pkt[last] ^= 0x01;
    node.homa.ingest(node.addr, &pkt);
    assert_eq!(hsk.active_rpcs(), 1);
}

#[test]
fn multi_bpage_messages_deliver_zero_copy() {
    let (client_node, server_node) =
        (TestNode::new(1, test_config()), TestNode::new(2, test_config()));
    let client = client_node.homa.bind(0).expect("bind client");
    client.set_buffer_region(4 * BPAGE_SIZE).expect("client region");
    let server = server_node.homa.bind(SERVER_PORT).expect("bind server");
    server.set_buffer_region(4 * BPAGE_SIZE).expect("server region");

    let body = patterned(BPAGE_SIZE + 12_345);
    client.send_request(server_node.port_addr(SERVER_PORT), &body, 0).expect("send");
    pump(&[&client_node, &server_node]);

    let req = server.try_receive(RecvFilter::Request).expect("recv").expect("request");
    assert_eq!(req.bpages.len(), 2);
    let region = server.buffer_region().expect("region");
    assert_eq!(region.in_use(), 2, "pages belong to the user now");

    // Read straight out of the region, page by page.
    let mut assembled = Vec::new();
    assembled.extend_from_slice(region.bpage(req.bpages[0]));
    assembled.extend_from_slice(&region.bpage(req.bpages[1])[..12_345]);
    assert_eq!(assembled, body);

    server.release_bpages(&req.bpages).expect("release");
    assert_eq!(region.in_use(), 0);
}
