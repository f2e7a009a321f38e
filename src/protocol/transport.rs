//! The transport instance.
//!
//! A [`Homa`] owns everything shared across sockets: the socket table, the
//! peer table, the grant scheduler, the pacer, the metrics, the client id
//! counter and the timer tick counter. One instance corresponds to one
//! network namespace of the kernel transport; most processes create exactly
//! one and bind sockets on it.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::config::Config;
use crate::error::HomaError;
use crate::link::PacketSink;
use crate::protocol::grant::GrantScheduler;
use crate::protocol::metrics::{Metrics, MetricsSnapshot};
use crate::protocol::pacer::Pacer;
use crate::protocol::peer::{Peer, PeerTable};
use crate::protocol::socket::HomaSocket;
use crate::protocol::wire::{
    ack_hdr, common_hdr, data_hdr, encode, homa_ack, install_checksum, packet_type,
};
use crate::protocol::{dispatch, timer, CONTROL_PRIORITY};

/// One Homa transport instance.
pub struct Homa {
    pub config: Config,
    pub(crate) sink: Arc<dyn PacketSink>,
    sockets: Mutex<HashMap<u16, Arc<HomaSocket>>>,
    prev_default_port: Mutex<u16>,
    next_client_id: AtomicU64,
    tick_count: AtomicU64,
    /// Version tag for this instance's unscheduled cutoffs, echoed by peers
    /// in their DATA headers.
    cutoff_version: u16,
    pub peers: PeerTable,
    pub grant: GrantScheduler,
    pub pacer: Pacer,
    pub(crate) metrics: Metrics,
}

impl Homa {
    /// Creates a transport that emits packets through `sink`.
    pub fn new(config: Config, sink: Arc<dyn PacketSink>) -> Arc<Self> {
        let peers = PeerTable::new(config.unsched_cutoffs);
        let grant = GrantScheduler::new(&config);
        let pacer = Pacer::new(&config);
        Arc::new(Self {
            config,
            sink,
            sockets: Mutex::new(HashMap::new()),
            prev_default_port: Mutex::new(0),
            next_client_id: AtomicU64::new(2),
            tick_count: AtomicU64::new(0),
            cutoff_version: 1,
            peers,
            grant,
            pacer,
            metrics: Metrics::default(),
        })
    }

    /// Binds a socket. `port == 0` allocates an ephemeral client port at or
    /// above `min_default_port`; explicit ports must lie below that
    /// boundary (server ports) and be free.
    pub fn bind(self: &Arc<Self>, port: u16) -> Result<Arc<HomaSocket>, HomaError> {
        let mut sockets = self.sockets.lock().expect("poisoned socket table");
        let port = if port == 0 {
            self.pick_default_port(&sockets)?
        } else {
            if port >= self.config.min_default_port {
                return Err(HomaError::InvalidPort);
            }
            if sockets.contains_key(&port) {
                return Err(HomaError::PortInUse);
            }
            port
        };
        let socket = HomaSocket::new(port, Arc::downgrade(self));
        sockets.insert(port, socket.clone());
        info!(port, "socket bound");
        Ok(socket)
    }

    /// Picks the next free ephemeral port, continuing from the previous
    /// allocation and wrapping within the default range.
    fn pick_default_port(
        &self,
        sockets: &HashMap<u16, Arc<HomaSocket>>,
    ) -> Result<u16, HomaError> {
        let first = self.config.min_default_port;
        let range = (u16::MAX - first) as u32 + 1;
        let mut prev = self.prev_default_port.lock().expect("poisoned port counter");
        for step in 1..=range {
            let candidate = first + (((*prev as u32) + step) % range) as u16;
            if !sockets.contains_key(&candidate) {
                *prev = candidate - first;
                return Ok(candidate);
            }
        }
        Err(HomaError::NoFreePorts)
    }

    pub(crate) fn unbind(&self, port: u16) {
        self.sockets.lock().expect("poisoned socket table").remove(&port);
    }

    pub(crate) fn socket_for_port(&self, port: u16) -> Option<Arc<HomaSocket>> {
        self.sockets.lock().expect("poisoned socket table").get(&port).cloned()
    }

    pub(crate) fn sockets_snapshot(&self) -> Vec<Arc<HomaSocket>> {
        self.sockets.lock().expect("poisoned socket table").values().cloned().collect()
    }

    /// Offers one received datagram to the dispatcher. `src` is the peer
    /// address the datagram arrived from.
    pub fn ingest(self: &Arc<Self>, src: IpAddr, datagram: &[u8]) {
        dispatch::ingest(self, src, datagram);
    }

    /// Runs one timer tick: pacer drain, per-RPC resend/timeout/ack checks,
    /// dead-RPC reaping and peer scavenging. Shells call this on a fixed
    /// interval; tests call it directly.
    pub fn tick(self: &Arc<Self>) {
        timer::tick(self);
    }

    pub(crate) fn advance_tick(&self) -> u64 {
        self.tick_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// The current timer tick count.
    pub fn current_tick(&self) -> u64 {
        self.tick_count.load(Ordering::Relaxed)
    }

    pub(crate) fn next_client_id(&self) -> u64 {
        self.next_client_id.fetch_add(2, Ordering::Relaxed)
    }

    /// Payload bytes that fit in one DATA packet.
    pub fn max_seg_data(&self) -> usize {
        self.config.mtu - data_hdr::LEN
    }

    pub(crate) fn cutoff_version(&self) -> u16 {
        self.cutoff_version
    }

    /// Stamps the checksum and hands one packet to the sink.
    pub(crate) fn deliver(&self, dst: IpAddr, priority: u8, mut packet: Vec<u8>) {
        install_checksum(&mut packet);
        Metrics::inc(&self.metrics.packets_sent);
        self.sink.deliver(dst, priority, packet);
    }

    /// Sends an explicit ACK packet carrying `acks` to `peer`.
    pub(crate) fn send_acks(
        &self,
        peer: &Peer,
        sport: u16,
        dport: u16,
        sender_id: u64,
        acks: Vec<homa_ack>,
    ) {
        let hdr = ack_hdr {
            common: common_hdr::new(
                packet_type::ACK,
                sport,
                dport,
                sender_id,
                ack_hdr::doff_for(acks.len()),
            ),
            acks,
        };
        self.deliver(peer.addr, CONTROL_PRIORITY, encode(&hdr));
        Metrics::inc(&self.metrics.acks_sent);
    }

    /// Counter snapshot.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Live sockets.
    pub fn socket_count(&self) -> usize {
        self.sockets.lock().expect("poisoned socket table").len()
    }

    /// Destroys every socket and drops all shared state. Meant for orderly
    /// teardown; the instance is inert afterwards.
    pub fn shutdown(self: &Arc<Self>) {
        for socket in self.sockets_snapshot() {
            socket.destroy();
        }
        self.pacer.clear();
        self.peers.clear();
    }
}
