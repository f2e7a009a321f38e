//! The grant scheduler.
//!
//! Inbound messages longer than their unscheduled allowance only keep
//! flowing because the receiver grants them further bytes. This scheduler
//! decides who gets those grants: across all peers it keeps at most
//! `num_active_rpcs` messages authorized at once, preferring the ones with
//! the fewest ungranted bytes (SRPT), and granting each active message a
//! window past its received frontier.
//!
//! Fairness between RPCs sharing a peer is deterministic two-round
//! selection: the first round considers only each peer's shortest grantable
//! message, the second round fills any remaining slots from the rest. A
//! single busy peer therefore cannot monopolize the active set while other
//! peers have traffic.
//!
//! Locking: the scheduler caches per-message state (`length`, frontier,
//! granted) in its own entries, computes every decision under its own lock,
//! and only then - lock dropped - applies each decision under the target
//! RPC's lock and emits the GRANT. Grants are monotone, so replaying a
//! stale decision is harmless. No path holds the scheduler lock while
//! taking an RPC lock.

use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::config::Config;
use crate::protocol::metrics::Metrics;
use crate::protocol::rpc::{HomaRpc, RpcState};
use crate::protocol::transport::Homa;
use crate::protocol::wire::{common_hdr, encode, grant_hdr, packet_type};
use crate::protocol::{CONTROL_PRIORITY, MAX_SCHED_PRIORITY};

struct GrantEntry {
    rpc: Arc<HomaRpc>,
    id: u64,
    length: u32,
    recv_end: u32,
    /// Latest cumulative grant decided for this message.
    granted: u32,
    /// True while the message cannot reserve bpages; grants are withheld.
    stalled: bool,
    /// Ticks without frontier progress while granted ahead of it; drives
    /// re-emission of a possibly lost GRANT.
    idle_ticks: u32,
}

impl GrantEntry {
    fn ungranted(&self) -> u32 {
        self.length.saturating_sub(self.granted)
    }

    fn sort_key(&self) -> (u32, u64) {
        (self.ungranted(), self.id)
    }
}

struct GrantablePeer {
    addr: IpAddr,
    /// Grantable messages from this peer, ascending by (ungranted, id).
    rpcs: Vec<GrantEntry>,
}

struct Decision {
    rpc: Arc<HomaRpc>,
    target: u32,
    priority: u8,
    /// Re-emission of an unchanged grant (suspected lost packet).
    reissue: bool,
}

/// Allocates receive bandwidth across inbound RPCs.
pub struct GrantScheduler {
    window: u32,
    max_active: usize,
    /// Ticks without progress before an active message's grant is re-sent.
    regrant_ticks: u32,
    peers: Mutex<Vec<GrantablePeer>>,
}

impl GrantScheduler {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            window: config.grant_window,
            max_active: config.num_active_rpcs.max(1),
            regrant_ticks: config.resend_ticks.max(1),
            peers: Mutex::new(Vec::new()),
        }
    }

    /// Inserts or refreshes the scheduler's view of an inbound message and
    /// reconsiders the active set. Called after reassembly progress, with
    /// no RPC lock held.
    pub(crate) fn update(
        &self,
        homa: &Homa,
        rpc: &Arc<HomaRpc>,
        length: u32,
        recv_end: u32,
        granted: u32,
        stalled: bool,
    ) {
        {
            let mut peers = self.peers.lock().expect("poisoned grant lists");
            let addr = rpc.peer.addr;
            let peer = match peers.iter_mut().find(|p| p.addr == addr) {
                Some(p) => p,
                None => {
                    peers.push(GrantablePeer { addr, rpcs: Vec::new() });
                    peers.last_mut().expect("just pushed")
                }
            };
            let entry = match peer.rpcs.iter().position(|e| e.id == rpc.id) {
                Some(pos) => {
                    let mut e = peer.rpcs.remove(pos);
                    e.recv_end = recv_end.max(e.recv_end);
                    e.granted = granted.max(e.granted);
                    e.stalled = stalled;
                    e.idle_ticks = 0;
                    e
                }
                None => GrantEntry {
                    rpc: rpc.clone(),
                    id: rpc.id,
                    length,
                    recv_end,
                    granted,
                    stalled,
                    idle_ticks: 0,
                },
            };
            let at = peer.rpcs.partition_point(|e| e.sort_key() <= entry.sort_key());
            peer.rpcs.insert(at, entry);
        }
        self.check(homa, false);
    }

    /// Detaches a message (completed or its RPC ended) and promotes a
    /// successor if a slot opened.
    pub(crate) fn remove(&self, homa: &Homa, rpc: &Arc<HomaRpc>) {
        {
            let mut peers = self.peers.lock().expect("poisoned grant lists");
            for peer in peers.iter_mut() {
                peer.rpcs.retain(|e| !Arc::ptr_eq(&e.rpc, rpc));
            }
            peers.retain(|p| !p.rpcs.is_empty());
        }
        rpc.grant_rank.store(usize::MAX, Ordering::Relaxed);
        self.check(homa, false);
    }

    /// Timer entry: ages active entries and re-emits grants that seem lost.
    pub(crate) fn on_tick(&self, homa: &Homa) {
        self.check(homa, true);
    }

    /// Recomputes the active set, assigns ranks, and emits any GRANTs that
    /// are due.
    fn check(&self, homa: &Homa, from_timer: bool) {
        let decisions = self.decide(from_timer);
        for d in decisions {
            let mut r = d.rpc.lock();
            if r.state == RpcState::Dead {
                continue;
            }
            let Some(msgin) = r.msgin.as_mut() else {
                continue;
            };
            if d.target > msgin.granted {
                msgin.granted = d.target;
            } else if !d.reissue {
                // A larger authorization raced in through another path;
                // the peer already knows at least this much.
                continue;
            }
            let offset = msgin.granted;
            let hdr = grant_hdr {
                common: common_hdr::new(
                    packet_type::GRANT,
                    d.rpc.local_port,
                    d.rpc.peer_port,
                    d.rpc.id,
                    grant_hdr::DOFF,
                ),
                offset,
                priority: d.priority,
                resend_all: 0,
                pad: [0; 2],
            };
            trace!(id = d.rpc.id, offset, priority = d.priority, "granting");
            homa.deliver(d.rpc.peer.addr, CONTROL_PRIORITY, encode(&hdr));
            Metrics::inc(&homa.metrics.grants_sent);
        }
    }

    /// The decision phase: everything done under the scheduler lock.
    fn decide(&self, from_timer: bool) -> Vec<Decision> {
        let mut peers = self.peers.lock().expect("poisoned grant lists");

        // Round one: each peer's shortest message. Round two: the rest.
        // (peer index, rpc index) pairs sorted by (ungranted, id).
        let mut candidates: Vec<((u32, u64), usize, usize)> = Vec::new();
        for (pi, peer) in peers.iter().enumerate() {
            if let Some(e) = peer.rpcs.first() {
                candidates.push((e.sort_key(), pi, 0));
            }
        }
        candidates.sort_unstable();
        candidates.truncate(self.max_active);
        if candidates.len() < self.max_active {
            let mut rest: Vec<((u32, u64), usize, usize)> = Vec::new();
            for (pi, peer) in peers.iter().enumerate() {
                for ri in 1..peer.rpcs.len() {
                    rest.push((peer.rpcs[ri].sort_key(), pi, ri));
                }
            }
            rest.sort_unstable();
            rest.truncate(self.max_active - candidates.len());
            candidates.extend(rest);
            candidates.sort_unstable();
        }

        let active: Vec<(usize, usize)> =
            candidates.iter().map(|&(_, pi, ri)| (pi, ri)).collect();
        for (pi, peer) in peers.iter().enumerate() {
            for (ri, entry) in peer.rpcs.iter().enumerate() {
                if !active.contains(&(pi, ri)) {
                    entry.rpc.grant_rank.store(usize::MAX, Ordering::Relaxed);
                }
            }
        }

        let mut decisions = Vec::new();
        for (rank, &(pi, ri)) in active.iter().enumerate() {
            let entry = &mut peers[pi].rpcs[ri];
            entry.rpc.grant_rank.store(rank, Ordering::Relaxed);
            if entry.stalled {
                continue;
            }
            let priority = MAX_SCHED_PRIORITY.saturating_sub(rank as u8);
            let target = entry.length.min(entry.recv_end.saturating_add(self.window));
            if target > entry.granted {
                entry.granted = target;
                entry.idle_ticks = 0;
                decisions.push(Decision {
                    rpc: entry.rpc.clone(),
                    target,
                    priority,
                    reissue: false,
                });
            } else if from_timer && entry.granted > entry.recv_end {
                // Granted bytes are outstanding but nothing is arriving;
                // after a while assume the GRANT was lost and repeat it.
                entry.idle_ticks += 1;
                if entry.idle_ticks >= self.regrant_ticks {
                    entry.idle_ticks = 0;
                    decisions.push(Decision {
                        rpc: entry.rpc.clone(),
                        target: entry.granted,
                        priority,
                        reissue: true,
                    });
                }
            }
        }
        decisions
    }

    /// Number of grantable messages currently tracked, for tests.
    pub fn grantable_rpcs(&self) -> usize {
        self.peers
            .lock()
            .expect("poisoned grant lists")
            .iter()
            .map(|p| p.rpcs.len())
            .sum()
    }
}
