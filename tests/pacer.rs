//! Pacer behavior: transmissions stop at the queue threshold, drain in
//! shortest-remaining-first order, and the bypasses work.

mod support;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use homa_mamont::config::FLAG_DONT_THROTTLE;
use homa_mamont::wire::Packet;
use homa_mamont::Config;

use support::{patterned, TestNode};

fn dest() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)), 50)
}

fn pacer_config() -> Config {
    Config {
        flags: 0,
        unsched_bytes: 20_000,
        throttle_min_bytes: 0,
        max_queued_bytes: 3_000,
        link_bytes_per_tick: 1_500,
        ..Config::default()
    }
}

/// (sender_id, offset) of every DATA packet in a drain.
fn data_pkts(node: &TestNode) -> Vec<(u64, u32)> {
    node.drain_parsed()
        .into_iter()
        .filter_map(|(_, p)| match p {
            Packet::Data { hdr, .. } => Some((hdr.common.sender_id, hdr.offset)),
            _ => None,
        })
        .collect()
}

#[test]
fn transmission_pauses_at_the_queue_threshold() {
    let node = TestNode::new(1, pacer_config());
    let hsk = node.homa.bind(0).expect("bind");
    hsk.send_request(dest(), &patterned(20_000), 0).expect("send");

    // Two 1500-byte packets fill the 3000-byte queue estimate.
    let burst = data_pkts(&node);
    assert_eq!(burst.len(), 2, "queue threshold reached after two packets");
    assert_eq!(node.homa.pacer.queued_bytes(), 3_000);

    // Each tick drains one packet's worth of link allowance.
    let mut total = burst.len();
    for _ in 0..40 {
        node.homa.tick();
        total += data_pkts(&node).len();
    }
    let expected = 20_000usize.div_ceil(node.homa.max_seg_data());
    assert_eq!(total, expected, "everything eventually transmits");
}

#[test]
fn throttled_rpcs_drain_shortest_remaining_first() {
    let node = TestNode::new(1, pacer_config());
    let hsk = node.homa.bind(0).expect("bind");
    let long_id = hsk.send_request(dest(), &patterned(20_000), 0).expect("send long");
    let _burst = data_pkts(&node);
    let short_id = hsk.send_request(dest(), &patterned(3_000), 0).expect("send short");
    assert!(data_pkts(&node).is_empty(), "short message fully deferred");

    let mut order = Vec::new();
    for _ in 0..40 {
        node.homa.tick();
        order.extend(data_pkts(&node));
    }
    let last_short = order
        .iter()
        .rposition(|&(id, _)| id == short_id)
        .expect("short message transmitted");
    let first_long = order
        .iter()
        .position(|&(id, _)| id == long_id)
        .expect("long message resumed");
    assert!(
        last_short < first_long,
        "short finishes before the long message resumes: {order:?}"
    );
}

#[test]
fn dont_throttle_flag_disables_pacing() {
    let node = TestNode::new(1, Config { flags: FLAG_DONT_THROTTLE, ..pacer_config() });
    let hsk = node.homa.bind(0).expect("bind");
    hsk.send_request(dest(), &patterned(20_000), 0).expect("send");
    let expected = 20_000usize.div_ceil(node.homa.max_seg_data());
    assert_eq!(data_pkts(&node).len(), expected);
    assert_eq!(node.homa.pacer.queued_bytes(), 0);
}

#[test]
fn small_packets_bypass_the_pacer() {
    let node = TestNode::new(1, Config { throttle_min_bytes: 2_000, ..pacer_config() });
    let hsk = node.homa.bind(0).expect("bind");
    // Every segment is under throttle_min_bytes, so the queue estimate never
    // defers anything.
    hsk.send_request(dest(), &patterned(20_000), 0).expect("send");
    let expected = 20_000usize.div_ceil(node.homa.max_seg_data());
    assert_eq!(data_pkts(&node).len(), expected);
}
