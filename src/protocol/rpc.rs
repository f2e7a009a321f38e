//! The RPC object and its state machine.
//!
//! A [`HomaRpc`] is the canonical state for one request/response exchange,
//! identified by `(peer, id)`. Client RPCs carry even local ids and are
//! created by `send_request`; server RPCs carry odd local ids and are
//! created by the dispatcher on the first request packet. All mutable state
//! lives behind the per-RPC lock; membership in the socket tables, the grant
//! scheduler and the pacer is explicit state guarded by the same lock.
//!
//! Lifecycle: a client RPC goes `Outgoing` -> `Incoming` (first response
//! byte) -> complete -> delivered -> `Dead`; a server RPC goes `Incoming` ->
//! complete -> `InService` (user holds the request) -> `Outgoing` (response
//! sent) -> `Dead` on acknowledgment. Any state may jump to `Dead` on error
//! or abort. A dead RPC is unreachable through the tables and lingers only
//! until the timer reaps its buffers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::trace;

use crate::error::HomaError;
use crate::protocol::msgin::Msgin;
use crate::protocol::msgout::Msgout;
use crate::protocol::peer::Peer;
use crate::protocol::rpc_is_client;
use crate::protocol::socket::HomaSocket;
use crate::protocol::transport::Homa;
use crate::protocol::wire::{common_hdr, data_hdr, encode, homa_ack, packet_type};

/// The four externally visible states of an RPC.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RpcState {
    /// This end is transmitting (request for clients, response for servers).
    Outgoing,
    /// This end is receiving.
    Incoming,
    /// Server only: the request has been handed to the user, who has not
    /// responded yet.
    InService,
    /// Terminal. Unreachable through the socket tables; buffers await the
    /// reaper.
    Dead,
}

/// Everything about an RPC that changes after creation, guarded by the RPC
/// lock.
pub struct RpcInner {
    pub state: RpcState,
    pub msgin: Option<Msgin>,
    pub msgout: Option<Msgout>,
    /// Ticks since the peer last made observable progress.
    pub silent_ticks: u32,
    /// Tick at which a server first saw its response fully transmitted;
    /// schedules NEED_ACK.
    pub done_timer_tick: Option<u64>,
    /// Sticky fatal error, delivered through the receive path.
    pub error: Option<HomaError>,
    /// Opaque user token echoed on completion (client RPCs).
    pub cookie: u64,
    /// Membership flags for the pacer and grant scheduler lists.
    pub throttled: bool,
    pub grantable: bool,
    /// Set once the message (or its error) has been handed to the user;
    /// bpage ownership moved with it.
    pub delivered: bool,
    /// Set once the RPC has been pushed on the socket's ready queue, so it
    /// is never queued twice.
    pub queued_ready: bool,
}

/// One RPC, shared between the socket tables, the scheduler lists and any
/// code path currently touching it.
pub struct HomaRpc {
    /// Local id: even for client RPCs, odd for server RPCs.
    pub id: u64,
    pub peer: Arc<Peer>,
    /// The peer's Homa port for this RPC.
    pub peer_port: u16,
    /// The owning socket's port.
    pub local_port: u16,
    pub(crate) inner: Mutex<RpcInner>,
    /// Rank within the grant scheduler's active set; `usize::MAX` when not
    /// active. Written only by the scheduler.
    pub(crate) grant_rank: AtomicUsize,
}

impl HomaRpc {
    pub(crate) fn new_client(
        id: u64,
        peer: Arc<Peer>,
        peer_port: u16,
        local_port: u16,
        cookie: u64,
        msgout: Msgout,
    ) -> Arc<Self> {
        debug_assert!(rpc_is_client(id));
        Arc::new(Self {
            id,
            peer,
            peer_port,
            local_port,
            inner: Mutex::new(RpcInner {
                state: RpcState::Outgoing,
                msgin: None,
                msgout: Some(msgout),
                silent_ticks: 0,
                done_timer_tick: None,
                error: None,
                cookie,
                throttled: false,
                grantable: false,
                delivered: false,
                queued_ready: false,
            }),
            grant_rank: AtomicUsize::new(usize::MAX),
        })
    }

    pub(crate) fn new_server(
        id: u64,
        peer: Arc<Peer>,
        peer_port: u16,
        local_port: u16,
    ) -> Arc<Self> {
        debug_assert!(!rpc_is_client(id));
        Arc::new(Self {
            id,
            peer,
            peer_port,
            local_port,
            inner: Mutex::new(RpcInner {
                state: RpcState::Incoming,
                msgin: None,
                msgout: None,
                silent_ticks: 0,
                done_timer_tick: None,
                error: None,
                cookie: 0,
                throttled: false,
                grantable: false,
                delivered: false,
                queued_ready: false,
            }),
            grant_rank: AtomicUsize::new(usize::MAX),
        })
    }

    /// True if this end initiated the RPC.
    pub fn is_client(&self) -> bool {
        rpc_is_client(self.id)
    }

    /// Acquires the RPC lock.
    pub(crate) fn lock(&self) -> MutexGuard<'_, RpcInner> {
        self.inner.lock().expect("poisoned RPC state")
    }

    /// Current state (snapshot).
    pub fn state(&self) -> RpcState {
        self.lock().state
    }

    /// Sticky error, if any (snapshot).
    pub fn error(&self) -> Option<HomaError> {
        self.lock().error
    }

    /// Rank in the grant scheduler's active set, if active.
    pub fn grant_rank(&self) -> Option<usize> {
        match self.grant_rank.load(Ordering::Relaxed) {
            usize::MAX => None,
            rank => Some(rank),
        }
    }
}

/// Builds the wire form of one DATA segment of `mo`.
fn build_data(rpc: &HomaRpc, mo: &Msgout, index: usize, retransmit: u8) -> (u8, Vec<u8>) {
    let pkt = &mo.packets[index];
    let hdr = data_hdr {
        common: common_hdr::new(
            packet_type::DATA,
            rpc.local_port,
            rpc.peer_port,
            rpc.id,
            data_hdr::DOFF,
        ),
        message_length: mo.length,
        incoming: mo.xmit_limit(),
        cutoff_version: rpc.peer.cutoff_version(),
        retransmit,
        pad: 0,
        offset: pkt.offset,
    };
    let mut buf = encode(&hdr);
    buf.extend_from_slice(&pkt.payload);
    let priority = if pkt.offset < mo.unscheduled {
        rpc.peer.unsched_priority(mo.length)
    } else {
        mo.sched_priority
    };
    (priority, buf)
}

/// Releases packets from `next_xmit_offset` up to the granted window.
///
/// Returns true if transmission stopped because the pacer wants the RPC
/// throttled; the caller then enqueues it. With `force` the pacer is
/// bypassed (pacer-driven and retransmission paths).
pub(crate) fn xmit(homa: &Homa, rpc: &HomaRpc, r: &mut RpcInner, force: bool) -> bool {
    let Some(mo) = r.msgout.as_mut() else {
        return false;
    };
    while mo.next_xmit < mo.packets.len() {
        let limit = mo.xmit_limit();
        let offset = mo.packets[mo.next_xmit].offset;
        if offset >= limit {
            break;
        }
        let payload_len = mo.packets[mo.next_xmit].payload.len();
        if !force && homa.pacer.should_defer(payload_len) {
            return true;
        }
        let (priority, buf) = build_data(rpc, mo, mo.next_xmit, 0);
        homa.pacer.note_sent(buf.len());
        homa.deliver(rpc.peer.addr, priority, buf);
        mo.next_xmit_offset = offset + payload_len as u32;
        mo.next_xmit += 1;
    }
    false
}

/// Retransmits the already-sent packets overlapping `[offset, offset +
/// length)` at `priority`, with the retransmit flag set.
pub(crate) fn resend_data(homa: &Homa, rpc: &HomaRpc, r: &mut RpcInner, offset: u32, length: u32, priority: u8) {
    let Some(mo) = r.msgout.as_ref() else {
        return;
    };
    let range = mo.xmitted_range(offset, length);
    for index in range {
        let (_, buf) = build_data(rpc, mo, index, 1);
        homa.pacer.note_sent(buf.len());
        homa.deliver(rpc.peer.addr, priority, buf);
    }
}

/// Moves the RPC to `Dead`: detaches it from the socket tables and the
/// scheduler lists, queues its buffers for reaping, and (for an errored,
/// undelivered client RPC) makes the error observable through the receive
/// path.
///
/// Idempotent: concurrent callers agree that exactly one performs the
/// transition. Returns whether this call did.
pub(crate) fn end(homa: &Homa, hsk: &HomaSocket, rpc: &Arc<HomaRpc>, error: Option<HomaError>) -> bool {
    let wake;
    let grantable;
    let throttled;
    {
        let mut sock = hsk.lock_inner();
        let mut r = rpc.lock();
        if r.state == RpcState::Dead {
            return false;
        }
        if let Some(e) = error {
            r.error.get_or_insert(e);
        }
        r.state = RpcState::Dead;
        r.silent_ticks = 0;
        if rpc.is_client() {
            sock.client_rpcs.remove(&rpc.id);
        } else {
            sock.server_rpcs.remove(&(rpc.peer.addr, rpc.id));
        }
        sock.active.retain(|a| !Arc::ptr_eq(a, rpc));
        let skbs = r.msgout.as_ref().map_or(0, |m| m.packets.len());
        sock.dead_skbs += skbs;
        sock.dead.push_back(rpc.clone());
        trace!(id = rpc.id, skbs, "RPC ended");

        wake = r.error.is_some() && rpc.is_client() && !r.delivered && !r.queued_ready;
        if wake {
            r.queued_ready = true;
            sock.ready.push_back(rpc.clone());
        }
        grantable = std::mem::take(&mut r.grantable);
        throttled = std::mem::take(&mut r.throttled);
    }
    if grantable {
        homa.grant.remove(homa, rpc);
    }
    if throttled {
        homa.pacer.remove(rpc);
    }
    rpc.grant_rank.store(usize::MAX, Ordering::Relaxed);

    // A finished client RPC owes the server an acknowledgment so it can
    // drop its state. Skip it when the server already told us it has none.
    if rpc.is_client() && error != Some(HomaError::RpcUnknown) {
        let ack = homa_ack::new(rpc.id, rpc.peer_port);
        if let Some(batch) = rpc.peer.add_ack(ack) {
            homa.send_acks(&rpc.peer, rpc.local_port, rpc.peer_port, rpc.id, batch);
        }
    }
    if wake {
        hsk.wake();
    }
    true
}
