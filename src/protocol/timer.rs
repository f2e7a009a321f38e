//! The periodic timer.
//!
//! [`tick`] runs the whole maintenance pass: drain the pacer, walk every
//! live RPC of every socket to account silence and emit RESEND / NEED_ACK,
//! fail RPCs that stayed silent too long, reap dead RPCs in fixed batches
//! once a socket's backlog passes its limit, scavenge idle peers, and age
//! the grant scheduler.
//!
//! The tick never blocks on user I/O: it takes each lock briefly, collects
//! what must happen, and sends packets through the (non-blocking) sink.
//! Shells invoke it from a timer task on `Config::tick_interval`; tests
//! invoke it directly, which makes every schedule in this file
//! deterministic.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::HomaError;
use crate::protocol::metrics::Metrics;
use crate::protocol::rpc::{self, HomaRpc, RpcState};
use crate::protocol::socket::HomaSocket;
use crate::protocol::transport::Homa;
use crate::protocol::wire::{common_hdr, encode, need_ack_hdr, packet_type, resend_hdr};
use crate::protocol::{CONTROL_PRIORITY, REAP_BATCH};

/// One timer tick.
pub(crate) fn tick(homa: &Arc<Homa>) {
    let now = homa.advance_tick();
    homa.pacer.on_tick(homa);

    for hsk in homa.sockets_snapshot() {
        if !hsk.is_shutdown() {
            check_rpcs(homa, &hsk, now);
        }
        // Over the limit, free a batch of packet buffers; otherwise just
        // pop any fully drained RPCs, which costs no budget.
        let budget = if hsk.dead_skbs() > homa.config.dead_buffs_limit { REAP_BATCH } else { 0 };
        let (skbs, rpcs) = hsk.reap(budget);
        if skbs > 0 || rpcs > 0 {
            homa.metrics.rpcs_reaped.fetch_add(rpcs as u64, std::sync::atomic::Ordering::Relaxed);
            trace!(port = hsk.port, skbs, rpcs, "reaped dead RPC state");
        }
    }

    homa.peers.scavenge(now, homa.config.peer_idle_ticks);
    homa.grant.on_tick(homa);
}

/// Walks one socket's live RPCs: silence accounting, RESEND and NEED_ACK
/// emission, and timeout collection.
fn check_rpcs(homa: &Arc<Homa>, hsk: &Arc<HomaSocket>, now: u64) {
    let cfg = &homa.config;
    let active: Vec<Arc<HomaRpc>> = hsk.lock_inner().active.clone();
    let mut expired: Vec<Arc<HomaRpc>> = Vec::new();

    for rpc in active {
        let mut r = rpc.lock();
        match r.state {
            RpcState::Dead => continue,
            // The user is processing the request; the peer owes us nothing.
            RpcState::InService => {
                r.silent_ticks = 0;
                continue;
            }
            RpcState::Outgoing | RpcState::Incoming => {}
        }

        // While we still have granted bytes to push out, any silence is our
        // own fault.
        if r.state == RpcState::Outgoing {
            if let Some(msgout) = r.msgout.as_ref() {
                if msgout.next_xmit_offset < msgout.xmit_limit() {
                    r.silent_ticks = 0;
                    continue;
                }
            }
        }

        // Server with the response fully on the wire: ask the client to
        // acknowledge so the state can be dropped.
        if !rpc.is_client()
            && r.state == RpcState::Outgoing
            && r.msgout.as_ref().is_some_and(|m| m.fully_transmitted())
        {
            let done = *r.done_timer_tick.get_or_insert(now);
            let waited = now.saturating_sub(done);
            if waited >= u64::from(cfg.request_ack_ticks)
                && (waited - u64::from(cfg.request_ack_ticks))
                    % u64::from(cfg.resend_interval.max(1))
                    == 0
            {
                send_need_ack(homa, &rpc);
            }
            r.silent_ticks += 1;
            if r.silent_ticks >= cfg.timeout_ticks {
                expired.push(rpc.clone());
            }
            continue;
        }

        // Receiving side: silence is only the peer's fault while it still
        // owes us authorized bytes.
        if r.state == RpcState::Incoming {
            if let Some(msgin) = r.msgin.as_ref() {
                if msgin.complete() {
                    // Fully received, waiting for local delivery.
                    r.silent_ticks = 0;
                    continue;
                }
                if msgin.stalled() || msgin.bytes_received >= msgin.granted {
                    // The peer sent everything it was allowed to, or we
                    // cannot take more; the silence is ours.
                    r.silent_ticks = 0;
                    continue;
                }
            }
        }

        r.silent_ticks += 1;
        let silent = r.silent_ticks;

        if silent >= cfg.resend_ticks
            && (silent - cfg.resend_ticks) % cfg.resend_interval.max(1) == 0
        {
            let (start, end) = match r.msgin.as_ref() {
                Some(msgin) => msgin.resend_range(),
                // No response byte yet: name the unscheduled prefix, the
                // peer clamps to what it has actually sent.
                None => (0, cfg.unsched_bytes),
            };
            if end > start {
                send_resend(homa, &rpc, start, end - start);
                rpc.peer.note_resend();
            }
        }

        if silent >= cfg.timeout_ticks
            || rpc.peer.outstanding_resends() >= cfg.timeout_resends
        {
            expired.push(rpc.clone());
        }
    }

    for rpc in expired {
        debug!(id = rpc.id, peer = %rpc.peer.addr, "RPC timed out");
        Metrics::inc(&homa.metrics.timeouts);
        rpc::end(homa, hsk, &rpc, Some(HomaError::TimedOut));
    }
}

fn send_resend(homa: &Homa, rpc: &HomaRpc, offset: u32, length: u32) {
    let hdr = resend_hdr {
        common: common_hdr::new(
            packet_type::RESEND,
            rpc.local_port,
            rpc.peer_port,
            rpc.id,
            resend_hdr::DOFF,
        ),
        offset,
        length,
        priority: CONTROL_PRIORITY,
        pad: [0; 3],
    };
    homa.deliver(rpc.peer.addr, CONTROL_PRIORITY, encode(&hdr));
    Metrics::inc(&homa.metrics.resends_sent);
}

fn send_need_ack(homa: &Homa, rpc: &HomaRpc) {
    let hdr = need_ack_hdr {
        common: common_hdr::new(
            packet_type::NEED_ACK,
            rpc.local_port,
            rpc.peer_port,
            rpc.id,
            need_ack_hdr::DOFF,
        ),
    };
    homa.deliver(rpc.peer.addr, CONTROL_PRIORITY, encode(&hdr));
    Metrics::inc(&homa.metrics.need_acks_sent);
}
