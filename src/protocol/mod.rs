//! The transport core.
//!
//! This module contains the interacting state machines that drive an RPC from
//! first byte to completion:
//!
//! - `wire`: packet headers and their big-endian encoding.
//! - `transport`: the [`transport::Homa`] instance owning sockets, peers,
//!   the grant scheduler and the pacer.
//! - `socket`: per-port state, RPC tables and the user-facing API.
//! - `rpc`: the canonical per-RPC object and its state machine.
//! - `msgin` / `msgout`: inbound reassembly and outbound fragmentation.
//! - `pool`: the user receive region carved into fixed-size bpages.
//! - `peer`: per-remote-host state, liveness and pending acknowledgments.
//! - `grant`: receive-bandwidth allocation across inbound RPCs.
//! - `pacer`: transmit throttling to keep NIC queues short.
//! - `dispatch`: demultiplexing of inbound packets onto RPCs.
//! - `timer`: the periodic pass that emits RESEND/NEED_ACK, times RPCs out
//!   and reaps dead state.
//! - `metrics`: monotonic counters for observability.

pub mod dispatch;
pub mod grant;
pub mod metrics;
pub mod msgin;
pub mod msgout;
pub mod pacer;
pub mod peer;
pub mod pool;
pub mod rpc;
pub mod socket;
pub mod timer;
pub mod transport;
pub mod wire;

/// Size of one buffer-pool page. The receive region registered by the user
/// must be a multiple of this.
pub const BPAGE_SIZE: usize = 64 * 1024;

/// log2 of [`BPAGE_SIZE`], for offset-to-bpage arithmetic.
pub const BPAGE_SHIFT: u32 = 16;

/// Number of packet priority levels carried on the wire.
pub const NUM_PRIORITIES: usize = 8;

/// Priority used for control packets (GRANT, RESEND, ACK, ...). Control
/// traffic always rides at the top level so it is never stuck behind data.
pub const CONTROL_PRIORITY: u8 = (NUM_PRIORITIES - 1) as u8;

/// Highest priority level the grant scheduler will assign to scheduled data;
/// levels above this are reserved for unscheduled traffic and control.
pub const MAX_SCHED_PRIORITY: u8 = 5;

/// Packet buffers freed per socket on each timer tick while the dead-RPC
/// list is over `dead_buffs_limit`.
pub const REAP_BATCH: usize = 10;

/// Pending acknowledgments a peer accumulates before they are flushed in an
/// explicit ACK packet.
pub const MAX_PENDING_ACKS: usize = 5;

/// Computes the local id for an RPC from the id a peer put on the wire.
/// Ids are assigned by clients from an even counter; the low bit encodes
/// which side is looking, so both ends flip it on receive.
pub fn local_id(wire_id: u64) -> u64 {
    wire_id ^ 1
}

/// True if `id` (in local form) identifies a client RPC, i.e. one this node
/// initiated.
pub fn rpc_is_client(id: u64) -> bool {
    id & 1 == 0
}
