//! Monotonic transport counters.
//!
//! The counters are plain relaxed atomics: they only ever increase, nothing
//! synchronizes through them, and a snapshot is allowed to be slightly torn
//! across fields. Tests use them to observe drops and recoveries that have
//! no other externally visible effect.

use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        /// Live counters owned by a transport instance.
        #[derive(Default)]
        pub struct Metrics {
            $($(#[$doc])* pub(crate) $name: AtomicU64,)*
        }

        /// Point-in-time copy of every counter.
        #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
        pub struct MetricsSnapshot {
            $($(#[$doc])* pub $name: u64,)*
        }

        impl Metrics {
            pub fn snapshot(&self) -> MetricsSnapshot {
                MetricsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters! {
    /// Packets handed to the link, all types.
    packets_sent,
    /// Datagrams offered to the dispatcher.
    packets_received,
    /// Datagrams dropped because they could not be parsed.
    malformed_packets,
    /// RPC_UNKNOWN replies sent for strays.
    unknown_rpc_sent,
    /// DATA segments carrying no new bytes.
    duplicate_data,
    /// DATA segments dropped for want of bpages.
    pool_exhausted,
    /// RESENDs emitted by the timer.
    resends_sent,
    /// RESENDs received from peers.
    resends_received,
    /// BUSY replies sent to show liveness.
    busys_sent,
    /// GRANTs emitted by the scheduler.
    grants_sent,
    /// NEED_ACKs emitted by the timer.
    need_acks_sent,
    /// Explicit ACK packets sent (flushes and NEED_ACK replies).
    acks_sent,
    /// CUTOFFS packets sent after a version mismatch.
    cutoffs_sent,
    /// RPCs failed with a timeout.
    timeouts,
    /// Dead RPCs fully reaped.
    rpcs_reaped,
}

impl Metrics {
    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
