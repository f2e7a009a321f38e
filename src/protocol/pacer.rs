//! The transmit pacer.
//!
//! Homa deliberately keeps NIC queues short: when the estimate of bytes
//! already queued toward the link passes a threshold, further data packets
//! are withheld and their RPCs parked on the throttled list. The list drains
//! shortest-remaining-message first (FIFO among equals) from the timer tick
//! and opportunistically from the transmit paths.
//!
//! The queue estimate is fed by every transmitted packet and drained by a
//! fixed allowance per tick modeling the link rate. Packets smaller than
//! `throttle_min_bytes` bypass the pacer entirely, and
//! [`crate::config::FLAG_DONT_THROTTLE`] disables it.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::{Config, FLAG_DONT_THROTTLE};
use crate::protocol::rpc::{self, HomaRpc, RpcState};
use crate::protocol::transport::Homa;

struct Throttled {
    rpc: Arc<HomaRpc>,
    /// Message bytes left at enqueue time; the sort key for SRPT order.
    remaining: u32,
    /// FIFO tie-break among equal `remaining`.
    seq: u64,
}

/// Serializes outbound transmission when the link queue estimate is over
/// the threshold.
pub struct Pacer {
    disabled: bool,
    throttle_min_bytes: usize,
    max_queued_bytes: usize,
    link_bytes_per_tick: usize,
    queued_bytes: AtomicUsize,
    next_seq: AtomicU64,
    throttled: Mutex<Vec<Throttled>>,
}

impl Pacer {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            disabled: config.has_flag(FLAG_DONT_THROTTLE),
            throttle_min_bytes: config.throttle_min_bytes,
            max_queued_bytes: config.max_queued_bytes,
            link_bytes_per_tick: config.link_bytes_per_tick,
            queued_bytes: AtomicUsize::new(0),
            next_seq: AtomicU64::new(0),
            throttled: Mutex::new(Vec::new()),
        }
    }

    /// Accounts one transmitted packet toward the queue estimate.
    pub(crate) fn note_sent(&self, bytes: usize) {
        if !self.disabled {
            self.queued_bytes.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    /// True if a data packet of `payload_len` bytes must wait its turn.
    pub(crate) fn should_defer(&self, payload_len: usize) -> bool {
        !self.disabled
            && payload_len >= self.throttle_min_bytes
            && self.queued_bytes.load(Ordering::Relaxed) >= self.max_queued_bytes
    }

    fn over_limit(&self) -> bool {
        !self.disabled && self.queued_bytes.load(Ordering::Relaxed) >= self.max_queued_bytes
    }

    /// Parks an RPC whose transmission was deferred. The caller holds the
    /// RPC lock and has set its `throttled` flag, so the RPC appears at
    /// most once here.
    pub(crate) fn enqueue(&self, rpc: Arc<HomaRpc>, remaining: u32) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.throttled
            .lock()
            .expect("poisoned pacer list")
            .push(Throttled { rpc, remaining, seq });
    }

    /// Detaches an RPC (it ended while parked).
    pub(crate) fn remove(&self, rpc: &Arc<HomaRpc>) {
        self.throttled
            .lock()
            .expect("poisoned pacer list")
            .retain(|t| !Arc::ptr_eq(&t.rpc, rpc));
    }

    /// Ticks the queue estimate down by the link allowance, then drains.
    pub(crate) fn on_tick(&self, homa: &Homa) {
        if self.disabled {
            return;
        }
        let _ = self.queued_bytes.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |q| {
            Some(q.saturating_sub(self.link_bytes_per_tick))
        });
        self.drain(homa);
    }

    /// Transmits from parked RPCs, shortest remaining message first, until
    /// the queue estimate is back over the threshold or the list is empty.
    pub(crate) fn drain(&self, homa: &Homa) {
        loop {
            if self.over_limit() {
                return;
            }
            // Pop the best entry without holding the list lock across the
            // RPC lock.
            let entry = {
                let mut list = self.throttled.lock().expect("poisoned pacer list");
                let best = list
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, t)| (t.remaining, t.seq))
                    .map(|(i, _)| i);
                match best {
                    Some(i) => list.swap_remove(i),
                    None => return,
                }
            };
            let rpc = entry.rpc;
            let mut r = rpc.lock();
            if r.state == RpcState::Dead || r.msgout.is_none() {
                r.throttled = false;
                continue;
            }
            let blocked = rpc::xmit(homa, &rpc, &mut r, false);
            if blocked {
                // Still congested; put it back and stop for now.
                let remaining =
                    r.msgout.as_ref().map_or(0, |m| m.length - m.next_xmit_offset);
                drop(r);
                self.enqueue(rpc, remaining);
                return;
            }
            r.throttled = false;
        }
    }

    /// Drops every parked RPC; used at transport shutdown.
    pub(crate) fn clear(&self) {
        self.throttled.lock().expect("poisoned pacer list").clear();
    }

    /// Current queue estimate, for tests.
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes.load(Ordering::Relaxed)
    }
}
