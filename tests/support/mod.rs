//! Shared harness for the integration tests: transport instances wired to
//! an in-memory network, plus builders for hand-crafted packets.
#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use homa_mamont::config::FLAG_DONT_THROTTLE;
use homa_mamont::link::{ChannelSink, Datagram};
use homa_mamont::wire::{common_hdr, data_hdr, encode, packet_type, parse_packet, Packet};
use homa_mamont::{Config, Homa};

/// One transport on the in-memory network, capturing everything it sends.
pub struct TestNode {
    pub addr: IpAddr,
    pub homa: Arc<Homa>,
    rx: Mutex<mpsc::UnboundedReceiver<Datagram>>,
}

impl TestNode {
    /// Creates a node at 10.0.0.`host`.
    pub fn new(host: u8, config: Config) -> TestNode {
        let (sink, rx) = ChannelSink::new();
        TestNode {
            addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, host)),
            homa: Homa::new(config, sink),
            rx: Mutex::new(rx),
        }
    }

    /// Everything the node has emitted since the last drain.
    pub fn drain(&self) -> Vec<Datagram> {
        let mut rx = self.rx.lock().expect("poisoned test receiver");
        let mut out = Vec::new();
        while let Ok(d) = rx.try_recv() {
            out.push(d);
        }
        out
    }

    /// Drained packets, parsed, with their priorities.
    pub fn drain_parsed(&self) -> Vec<(Datagram, Packet)> {
        self.drain()
            .into_iter()
            .map(|d| {
                let pkt = parse_packet(&d.bytes).expect("node emitted unparsable packet");
                (d, pkt)
            })
            .collect()
    }

    /// The address of one of this node's Homa ports.
    pub fn port_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.addr, port)
    }
}

/// Shuttles packets between nodes until a full round moves nothing.
/// Packets to addresses no node owns are dropped, like any lost datagram.
pub fn pump(nodes: &[&TestNode]) {
    for _ in 0..1000 {
        let mut moved = false;
        for node in nodes {
            for d in node.drain() {
                if let Some(dst) = nodes.iter().find(|n| n.addr == d.dst) {
                    dst.homa.ingest(node.addr, &d.bytes);
                    moved = true;
                }
            }
        }
        if !moved {
            return;
        }
    }
    panic!("network did not quiesce in 1000 rounds");
}

/// A config with pacing off and short, test-friendly timer schedules.
pub fn test_config() -> Config {
    Config {
        flags: FLAG_DONT_THROTTLE,
        resend_ticks: 3,
        resend_interval: 2,
        timeout_ticks: 9,
        timeout_resends: 100,
        request_ack_ticks: 2,
        peer_idle_ticks: 0,
        ..Config::default()
    }
}

/// Builds a DATA packet the way a remote sender would.
pub fn data_packet(
    sport: u16,
    dport: u16,
    wire_sender_id: u64,
    message_length: u32,
    incoming: u32,
    offset: u32,
    payload: &[u8],
) -> Vec<u8> {
    let hdr = data_hdr {
        common: common_hdr::new(packet_type::DATA, sport, dport, wire_sender_id, data_hdr::DOFF),
        message_length,
        incoming,
        // Matches a fresh transport's version so tests that do not care
        // about the CUTOFFS exchange never trigger it.
        cutoff_version: 1,
        retransmit: 0,
        pad: 0,
        offset,
    };
    let mut buf = encode(&hdr);
    buf.extend_from_slice(payload);
    buf
}

/// A payload whose bytes encode their own offsets, so any reassembly error
/// shows up in content and not just in length.
pub fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
