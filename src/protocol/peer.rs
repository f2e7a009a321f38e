//! Per-remote-host state.
//!
//! A [`Peer`] exists for every remote address this transport has exchanged
//! packets with. It carries the state that is shared by all RPCs to that
//! host: the priority cutoffs to use for unscheduled traffic (learned from
//! CUTOFFS packets), the count of RESENDs the host has left unanswered, and
//! the bounded FIFO of acknowledgments waiting to be shipped.
//!
//! Entries are `Arc`-shared: the table holds one reference and every live
//! RPC to the host holds another. The timer scavenges entries whose only
//! remaining reference is the table's and whose last activity is old.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use smallvec::SmallVec;

use crate::protocol::wire::homa_ack;
use crate::protocol::{MAX_PENDING_ACKS, NUM_PRIORITIES};

struct PeerState {
    /// RESENDs sent to this host since it last made progress.
    outstanding_resends: u32,
    /// Acknowledgments of completed client RPCs awaiting transport.
    pending_acks: SmallVec<[homa_ack; MAX_PENDING_ACKS]>,
    /// Priority cutoffs to apply when sending unscheduled data to this host.
    cutoffs: [u32; NUM_PRIORITIES],
    /// Version of `cutoffs`; zero until the host has told us its table.
    cutoff_version: u16,
    /// Timer tick of the last packet seen from this host.
    last_active_tick: u64,
    /// Tick of the last CUTOFFS we published to this host, to keep a burst
    /// of stale DATA from provoking a burst of CUTOFFS.
    last_cutoffs_sent_tick: Option<u64>,
}

/// State for one remote host.
pub struct Peer {
    pub addr: IpAddr,
    state: Mutex<PeerState>,
}

impl Peer {
    fn new(addr: IpAddr, default_cutoffs: [u32; NUM_PRIORITIES], tick: u64) -> Self {
        Self {
            addr,
            state: Mutex::new(PeerState {
                outstanding_resends: 0,
                pending_acks: SmallVec::new(),
                cutoffs: default_cutoffs,
                cutoff_version: 0,
                last_active_tick: tick,
                last_cutoffs_sent_tick: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PeerState> {
        self.state.lock().expect("poisoned peer state")
    }

    /// Records a packet from this host: resets the resend debt and stamps
    /// liveness.
    pub fn note_progress(&self, tick: u64) {
        let mut state = self.lock();
        state.outstanding_resends = 0;
        state.last_active_tick = tick;
    }

    /// Records a RESEND sent to this host; returns the new outstanding count.
    pub fn note_resend(&self) -> u32 {
        let mut state = self.lock();
        state.outstanding_resends += 1;
        state.outstanding_resends
    }

    pub fn outstanding_resends(&self) -> u32 {
        self.lock().outstanding_resends
    }

    /// Installs the cutoff table the host published. Any version change is
    /// accepted; versions only need to differ to signal staleness.
    pub fn set_cutoffs(&self, cutoffs: [u32; NUM_PRIORITIES], version: u16) {
        let mut state = self.lock();
        state.cutoffs = cutoffs;
        state.cutoff_version = version;
    }

    /// Version of the host's cutoff table we last saw, echoed in every DATA
    /// header we send it.
    pub fn cutoff_version(&self) -> u16 {
        self.lock().cutoff_version
    }

    /// Priority for the unscheduled bytes of a `length`-byte message to this
    /// host: the highest level whose cutoff admits the message.
    pub fn unsched_priority(&self, length: u32) -> u8 {
        let state = self.lock();
        for p in (0..NUM_PRIORITIES).rev() {
            if state.cutoffs[p] >= length {
                return p as u8;
            }
        }
        0
    }

    /// Queues an acknowledgment for piggybacking. If the FIFO is full the
    /// whole batch is returned and must be flushed in an explicit ACK packet.
    pub fn add_ack(&self, ack: homa_ack) -> Option<Vec<homa_ack>> {
        let mut state = self.lock();
        state.pending_acks.push(ack);
        if state.pending_acks.len() >= MAX_PENDING_ACKS {
            return Some(state.pending_acks.drain(..).collect());
        }
        None
    }

    /// Drains every pending acknowledgment, e.g. to attach to an outbound
    /// ACK.
    pub fn take_acks(&self) -> Vec<homa_ack> {
        self.lock().pending_acks.drain(..).collect()
    }

    pub fn last_active_tick(&self) -> u64 {
        self.lock().last_active_tick
    }

    /// Returns true at most once per tick: whether a CUTOFFS update should
    /// be published to this host now.
    pub fn should_send_cutoffs(&self, tick: u64) -> bool {
        let mut state = self.lock();
        if state.last_cutoffs_sent_tick == Some(tick) {
            return false;
        }
        state.last_cutoffs_sent_tick = Some(tick);
        true
    }
}

/// The concurrent table of peers, keyed by remote address.
pub struct PeerTable {
    default_cutoffs: [u32; NUM_PRIORITIES],
    peers: Mutex<HashMap<IpAddr, Arc<Peer>>>,
}

impl PeerTable {
    pub fn new(default_cutoffs: [u32; NUM_PRIORITIES]) -> Self {
        Self { default_cutoffs, peers: Mutex::new(HashMap::new()) }
    }

    /// Finds the peer for `addr`, creating it on first contact.
    pub fn lookup_or_create(&self, addr: IpAddr, tick: u64) -> Arc<Peer> {
        let mut peers = self.peers.lock().expect("poisoned peer table");
        peers
            .entry(addr)
            .or_insert_with(|| Arc::new(Peer::new(addr, self.default_cutoffs, tick)))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.peers.lock().expect("poisoned peer table").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops entries that nothing references any more and that have been
    /// idle for at least `idle_ticks`. Called from the timer.
    pub fn scavenge(&self, tick: u64, idle_ticks: u64) {
        let mut peers = self.peers.lock().expect("poisoned peer table");
        peers.retain(|_, peer| {
            Arc::strong_count(peer) > 1
                || tick.saturating_sub(peer.last_active_tick()) < idle_ticks
        });
    }

    /// Drops the table's references to all peers. Entries still referenced
    /// by live RPCs stay alive through those references.
    pub fn clear(&self) {
        self.peers.lock().expect("poisoned peer table").clear();
    }
}
