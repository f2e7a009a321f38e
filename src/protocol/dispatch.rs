//! Inbound packet dispatch.
//!
//! [`ingest`] is the single entry point for received datagrams: it parses
//! the packet, finds the destination socket by port, maps the wire id to the
//! local RPC (creating a server RPC on the first DATA of a request), answers
//! strays with RPC_UNKNOWN, and routes the packet to its per-type handler
//! under the RPC lock. Malformed input is dropped with a counter bump and
//! never mutates transport state.

use std::net::IpAddr;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::error::HomaError;
use crate::protocol::metrics::Metrics;
use crate::protocol::msgin::{Accept, Msgin};
use crate::protocol::rpc::{self, HomaRpc, RpcState};
use crate::protocol::socket::HomaSocket;
use crate::protocol::transport::Homa;
use crate::protocol::wire::{
    busy_hdr, common_hdr, cutoffs_hdr, data_hdr, encode, grant_hdr, packet_type, parse_packet,
    resend_hdr, rpc_unknown_hdr, verify_checksum, Packet,
};
use crate::protocol::{local_id, rpc_is_client, CONTROL_PRIORITY};

/// Dispatches one received datagram.
pub(crate) fn ingest(homa: &Arc<Homa>, src: IpAddr, datagram: &[u8]) {
    Metrics::inc(&homa.metrics.packets_received);
    if !verify_checksum(datagram) {
        Metrics::inc(&homa.metrics.malformed_packets);
        warn!(%src, "dropping packet with bad checksum");
        return;
    }
    let pkt = match parse_packet(datagram) {
        Ok(pkt) => pkt,
        Err(e) => {
            Metrics::inc(&homa.metrics.malformed_packets);
            warn!(%src, "dropping malformed packet: {e}");
            return;
        }
    };
    let common = *pkt.common();
    let Some(hsk) = homa.socket_for_port(common.dport) else {
        trace!(%src, dport = common.dport, "no socket for packet");
        return;
    };
    let id = local_id(common.sender_id);
    let tick = homa.current_tick();

    // ACK touches several RPCs, possibly on several sockets.
    if let Packet::Ack(ack) = &pkt {
        let peer = homa.peers.lookup_or_create(src, tick);
        peer.note_progress(tick);
        if !rpc_is_client(id) {
            if let Some(rpc) = hsk.lock_inner().server_rpcs.get(&(src, id)).cloned() {
                rpc::end(homa, &hsk, &rpc, None);
            }
        }
        for ack in &ack.acks {
            let server_id = local_id(ack.client_id);
            let Some(target_hsk) = homa.socket_for_port(ack.server_port) else {
                continue;
            };
            let target =
                target_hsk.lock_inner().server_rpcs.get(&(src, server_id)).cloned();
            if let Some(target) = target {
                rpc::end(homa, &target_hsk, &target, None);
            }
        }
        return;
    }

    let found = {
        let inner = hsk.lock_inner();
        if rpc_is_client(id) {
            inner.client_rpcs.get(&id).filter(|r| r.peer.addr == src).cloned()
        } else {
            inner.server_rpcs.get(&(src, id)).cloned()
        }
    };
    let rpc = match found {
        Some(rpc) => rpc,
        None => match &pkt {
            Packet::Data { hdr, .. } if !rpc_is_client(id) && !hsk.is_shutdown() => {
                alloc_server(homa, &hsk, src, id, hdr.common.sport, tick)
            }
            // A stray RPC_UNKNOWN answers nothing; answering it would ping-pong.
            Packet::RpcUnknown(_) => return,
            // NEED_ACK for an RPC we already reaped: it completed, say so.
            Packet::NeedAck(_) => {
                let peer = homa.peers.lookup_or_create(src, tick);
                peer.note_progress(tick);
                let acks = peer.take_acks();
                homa.send_acks(&peer, common.dport, common.sport, id, acks);
                return;
            }
            _ => {
                send_rpc_unknown(homa, src, &common);
                return;
            }
        },
    };

    rpc.peer.note_progress(tick);

    match pkt {
        Packet::Data { hdr, payload } => handle_data(homa, &hsk, &rpc, &hdr, &payload, tick),
        Packet::Grant(hdr) => handle_grant(homa, &rpc, &hdr),
        Packet::Resend(hdr) => handle_resend(homa, &rpc, &hdr),
        Packet::Busy(_) => {
            rpc.lock().silent_ticks = 0;
        }
        Packet::NeedAck(_) => handle_need_ack(homa, &rpc),
        Packet::RpcUnknown(_) => {
            debug!(id = rpc.id, "peer has no state for RPC");
            if rpc.is_client() {
                rpc::end(homa, &hsk, &rpc, Some(HomaError::RpcUnknown));
            } else {
                // For a server this is an implicit acknowledgment of the
                // response: the client is gone, discard our state.
                rpc::end(homa, &hsk, &rpc, None);
            }
        }
        Packet::Cutoffs(hdr) => {
            rpc.lock().silent_ticks = 0;
            rpc.peer.set_cutoffs(hdr.unsched_cutoffs, hdr.cutoff_version);
        }
        Packet::Freeze(_) => debug!(id = rpc.id, "FREEZE ignored"),
        Packet::Ack(_) => unreachable!("handled above"),
    }

    homa.pacer.drain(homa);
}

/// Creates the server-side RPC for the first packet of a request, or returns
/// the one a racing packet created.
fn alloc_server(
    homa: &Arc<Homa>,
    hsk: &Arc<HomaSocket>,
    src: IpAddr,
    id: u64,
    sport: u16,
    tick: u64,
) -> Arc<HomaRpc> {
    let peer = homa.peers.lookup_or_create(src, tick);
    let mut inner = hsk.lock_inner();
    if let Some(existing) = inner.server_rpcs.get(&(src, id)) {
        return existing.clone();
    }
    let rpc = HomaRpc::new_server(id, peer, sport, hsk.port);
    inner.server_rpcs.insert((src, id), rpc.clone());
    inner.active.push(rpc.clone());
    trace!(id, %src, "created server RPC");
    rpc
}

fn send_rpc_unknown(homa: &Homa, src: IpAddr, common: &common_hdr) {
    let hdr = rpc_unknown_hdr {
        common: common_hdr::new(
            packet_type::RPC_UNKNOWN,
            common.dport,
            common.sport,
            local_id(common.sender_id),
            rpc_unknown_hdr::DOFF,
        ),
    };
    homa.deliver(src, CONTROL_PRIORITY, encode(&hdr));
    Metrics::inc(&homa.metrics.unknown_rpc_sent);
}

fn send_busy(homa: &Homa, rpc: &HomaRpc) {
    let hdr = busy_hdr {
        common: common_hdr::new(
            packet_type::BUSY,
            rpc.local_port,
            rpc.peer_port,
            rpc.id,
            busy_hdr::DOFF,
        ),
    };
    homa.deliver(rpc.peer.addr, CONTROL_PRIORITY, encode(&hdr));
    Metrics::inc(&homa.metrics.busys_sent);
}

fn handle_data(
    homa: &Arc<Homa>,
    hsk: &Arc<HomaSocket>,
    rpc: &Arc<HomaRpc>,
    hdr: &data_hdr,
    payload: &[u8],
    tick: u64,
) {
    let region = hsk.pool.region();
    let mut completed = false;
    let mut grant_update = None;
    let mut grant_remove = false;
    {
        let mut r = rpc.lock();
        if r.state == RpcState::Dead {
            return;
        }
        r.silent_ticks = 0;
        if rpc.is_client() && r.state == RpcState::Outgoing {
            // First byte of the response: the server has the whole request.
            r.state = RpcState::Incoming;
        }
        if !rpc.is_client() && r.state != RpcState::Incoming {
            // Request data replayed after the message completed.
            Metrics::inc(&homa.metrics.duplicate_data);
            return;
        }
        if r.msgin.is_none() {
            let length = hdr.message_length;
            if length == 0 || length > homa.config.max_message_length {
                Metrics::inc(&homa.metrics.malformed_packets);
                warn!(id = rpc.id, length, "DATA with unusable message length");
                return;
            }
            let unsched = homa.config.unsched_bytes.min(length);
            r.msgin = Some(Msgin::new(length, hdr.incoming.max(unsched)));
        }
        {
            let msgin = r.msgin.as_mut().expect("installed above");
            if hdr.incoming > msgin.granted {
                msgin.granted = hdr.incoming.min(msgin.length);
            }
            let outcome = match region.as_deref() {
                Some(region) => msgin.accept(region, hdr.offset, payload, tick),
                None => Accept::NoBuffers,
            };
            match outcome {
                Accept::Accepted { complete, .. } => completed = complete,
                Accept::Duplicate => Metrics::inc(&homa.metrics.duplicate_data),
                Accept::NoBuffers => Metrics::inc(&homa.metrics.pool_exhausted),
                Accept::Malformed => {
                    Metrics::inc(&homa.metrics.malformed_packets);
                    return;
                }
            }
        }
        let msgin = r.msgin.as_ref().expect("installed above");
        let needs_grants = msgin.length > msgin.granted;
        let update = (msgin.length, msgin.recv_end, msgin.granted, msgin.stalled());
        if completed {
            grant_remove = std::mem::take(&mut r.grantable);
            if !r.queued_ready {
                r.queued_ready = true;
            } else {
                completed = false;
            }
        } else if needs_grants || r.grantable {
            r.grantable = true;
            grant_update = Some(update);
        }
    }

    if completed {
        hsk.lock_inner().ready.push_back(rpc.clone());
        hsk.wake();
    }
    if grant_remove {
        homa.grant.remove(homa, rpc);
    }
    if let Some((length, recv_end, granted, stalled)) = grant_update {
        homa.grant.update(homa, rpc, length, recv_end, granted, stalled);
    }

    // Our cutoff table is stale at the sender; publish a fresh copy.
    if hdr.cutoff_version != homa.cutoff_version() && rpc.peer.should_send_cutoffs(tick) {
        let cutoffs = cutoffs_hdr {
            common: common_hdr::new(
                packet_type::CUTOFFS,
                rpc.local_port,
                rpc.peer_port,
                rpc.id,
                cutoffs_hdr::DOFF,
            ),
            unsched_cutoffs: homa.config.unsched_cutoffs,
            cutoff_version: homa.cutoff_version(),
            pad: [0; 2],
        };
        homa.deliver(rpc.peer.addr, CONTROL_PRIORITY, encode(&cutoffs));
        Metrics::inc(&homa.metrics.cutoffs_sent);
    }
}

fn handle_grant(homa: &Arc<Homa>, rpc: &Arc<HomaRpc>, hdr: &grant_hdr) {
    let mut r = rpc.lock();
    if r.state != RpcState::Outgoing || r.msgout.is_none() {
        return;
    }
    r.silent_ticks = 0;
    {
        let msgout = r.msgout.as_mut().expect("checked above");
        msgout.register_grant(hdr.offset);
        msgout.sched_priority = hdr.priority;
    }
    if hdr.resend_all != 0 {
        let upto = r.msgout.as_ref().expect("checked above").next_xmit_offset;
        rpc::resend_data(homa, rpc, &mut r, 0, upto, hdr.priority);
    }
    if rpc::xmit(homa, rpc, &mut r, false) && !r.throttled {
        r.throttled = true;
        let remaining = r.msgout.as_ref().map_or(0, |m| m.length - m.next_xmit_offset);
        homa.pacer.enqueue(rpc.clone(), remaining);
    }
}

fn handle_resend(homa: &Arc<Homa>, rpc: &Arc<HomaRpc>, hdr: &resend_hdr) {
    Metrics::inc(&homa.metrics.resends_received);
    let mut r = rpc.lock();
    if r.state == RpcState::Dead {
        return;
    }
    r.silent_ticks = 0;
    let sent = match (r.state, r.msgout.as_ref()) {
        (RpcState::Outgoing, Some(m)) => m.next_xmit_offset,
        _ => 0,
    };
    let end = hdr.offset.saturating_add(hdr.length).min(sent);
    if hdr.offset >= end {
        // Nothing retransmittable in the range; show liveness instead
        // (e.g. a server still waiting for the user's response).
        drop(r);
        send_busy(homa, rpc);
        return;
    }
    rpc::resend_data(homa, rpc, &mut r, hdr.offset, end - hdr.offset, hdr.priority);
    // The peer is actively missing data; push out anything else the grant
    // window allows, pacer or not.
    rpc::xmit(homa, rpc, &mut r, true);
}

fn handle_need_ack(homa: &Arc<Homa>, rpc: &Arc<HomaRpc>) {
    let complete = {
        let mut r = rpc.lock();
        r.silent_ticks = 0;
        rpc.is_client() && r.msgin.as_ref().is_some_and(|m| m.complete())
    };
    // Only acknowledge once the response is fully here; otherwise the
    // server must keep its state for retransmission.
    if complete {
        let acks = rpc.peer.take_acks();
        homa.send_acks(&rpc.peer, rpc.local_port, rpc.peer_port, rpc.id, acks);
    }
}
