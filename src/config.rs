//! Transport configuration.
//!
//! Every tunable of the transport core lives here. A [`Config`] is fixed for
//! the lifetime of a [`crate::Homa`] instance; the defaults correspond to a
//! 1 ms timer tick on a 10 Gbps link and are the values the test suite is
//! written against.

use std::time::Duration;

use crate::protocol::NUM_PRIORITIES;

/// Disables the pacer entirely: every packet is handed to the sink the moment
/// it becomes transmittable. Intended for tests and loss-free local links.
pub const FLAG_DONT_THROTTLE: u64 = 1;

/// Tunables for one transport instance.
///
/// Tick-denominated fields count invocations of the periodic timer; with the
/// default 1 ms tick interval a value of 5 means roughly 5 ms.
#[derive(Debug, Clone)]
pub struct Config {
    /// Link MTU in bytes. Message payloads are fragmented so that no packet,
    /// including its Homa header, exceeds this.
    pub mtu: usize,

    /// Bytes of a message every sender may transmit without waiting for
    /// grants. Also bounds the range named by a RESEND sent before any
    /// response byte has arrived.
    pub unsched_bytes: u32,

    /// Largest acceptable message, enforced on both the send and receive
    /// paths.
    pub max_message_length: u32,

    /// Ticks of silence from a peer before the first RESEND is sent.
    pub resend_ticks: u32,

    /// Ticks between RESENDs once the first one has been sent.
    pub resend_interval: u32,

    /// Ticks of silence after which an RPC is failed with a timeout.
    pub timeout_ticks: u32,

    /// Unanswered RESENDs to a peer after which its RPCs are failed with a
    /// timeout, without waiting for `timeout_ticks`.
    pub timeout_resends: u32,

    /// Ticks a server waits after fully transmitting a response before
    /// asking the client for an explicit acknowledgment with NEED_ACK.
    pub request_ack_ticks: u32,

    /// Packet buffers that may accumulate on a socket's dead-RPC list before
    /// the timer starts reaping them.
    pub dead_buffs_limit: usize,

    /// Bytes past a message's received frontier that the grant scheduler
    /// keeps authorized for each active inbound RPC.
    pub grant_window: u32,

    /// Maximum number of inbound RPCs that may hold grants simultaneously.
    pub num_active_rpcs: usize,

    /// Data payloads shorter than this bypass the pacer even when the
    /// estimated output queue is over `max_queued_bytes`.
    pub throttle_min_bytes: usize,

    /// Estimated bytes queued toward the NIC above which further
    /// transmissions are serialized through the pacer.
    pub max_queued_bytes: usize,

    /// Bytes the output queue estimate is drained by on every timer tick.
    /// The default models a 10 Gbps link and a 1 ms tick.
    pub link_bytes_per_tick: usize,

    /// Behavior flags (`FLAG_*` constants).
    pub flags: u64,

    /// First port of the ephemeral client range. `bind(0)` allocates at or
    /// above this boundary; explicit binds must stay below it.
    pub min_default_port: u16,

    /// Per-priority message-size cutoffs for unscheduled packets:
    /// `cutoffs[p]` is the largest message that may use priority `p`.
    /// Advertised to peers through CUTOFFS packets.
    pub unsched_cutoffs: [u32; NUM_PRIORITIES],

    /// Ticks a peer table entry may sit unreferenced and idle before the
    /// timer scavenges it.
    pub peer_idle_ticks: u64,

    /// Interval between timer ticks, used by the shells that drive
    /// [`crate::Homa::tick`] from a clock.
    pub tick_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mtu: 1500,
            unsched_bytes: 10_000,
            max_message_length: 1_000_000,
            resend_ticks: 5,
            resend_interval: 5,
            timeout_ticks: 100,
            timeout_resends: 5,
            request_ack_ticks: 2,
            dead_buffs_limit: 5_000,
            grant_window: 64 * 1024,
            num_active_rpcs: 10,
            throttle_min_bytes: 200,
            max_queued_bytes: 100_000,
            link_bytes_per_tick: 1_250_000,
            flags: 0,
            min_default_port: 0x8000,
            unsched_cutoffs: [
                u32::MAX,
                u32::MAX,
                u32::MAX,
                u32::MAX,
                u32::MAX,
                0x10_0000,
                0x1_0000,
                5_760,
            ],
            peer_idle_ticks: 600_000,
            tick_interval: Duration::from_millis(1),
        }
    }
}

impl Config {
    /// True if `flag` (one of the `FLAG_*` constants) is set.
    pub fn has_flag(&self, flag: u64) -> bool {
        self.flags & flag != 0
    }
}
