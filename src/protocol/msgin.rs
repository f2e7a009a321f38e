//! Inbound message reassembly.
//!
//! A [`Msgin`] tracks one partially received message: the contiguous
//! frontier (`recv_end`), the list of gaps below it, the cumulative grant,
//! and the bpages the payload is being assembled into. Packets may arrive
//! duplicated, reordered or partially overlapping; [`Msgin::accept`] reduces
//! all of that to "which byte positions are new", so the received set is
//! always exactly the union of the positions covered by accepted packets.
//!
//! Invariants kept here: gaps are pairwise disjoint, sorted by start, all
//! below `recv_end`; `bytes_received` equals `recv_end` minus the bytes
//! still missing inside gaps; the message is complete exactly when the gap
//! list is empty and `bytes_received == length`.

use smallvec::SmallVec;

use crate::protocol::pool::PoolRegion;
use crate::protocol::{BPAGE_SHIFT, BPAGE_SIZE};

/// A hole in the received byte range: `[start, end)` has not arrived.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Gap {
    pub start: u32,
    pub end: u32,
    /// Tick at which the hole was first observed, for resend aging.
    pub first_seen_tick: u64,
}

/// Outcome of offering one DATA segment to a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Accept {
    /// At least one new byte was installed.
    Accepted { new_bytes: u32, complete: bool },
    /// Every byte of the segment had already been received.
    Duplicate,
    /// Bpages could not be reserved; nothing was mutated, the sender will
    /// retransmit.
    NoBuffers,
    /// The segment does not fit inside the message; dropped.
    Malformed,
}

/// Reassembly state for one inbound message.
pub struct Msgin {
    /// Total message length, learned from the first DATA packet.
    pub length: u32,
    /// All bytes below this offset have been received, except those inside
    /// `gaps`.
    pub recv_end: u32,
    /// Holes below `recv_end`, disjoint and sorted by start.
    pub gaps: SmallVec<[Gap; 4]>,
    /// Total distinct bytes received so far.
    pub bytes_received: u32,
    /// Cumulative bytes the sender is authorized to transmit. Monotone;
    /// never exceeds `length`.
    pub granted: u32,
    /// Bpages holding the payload, in message order. Empty until the pool
    /// reservation succeeds.
    pub bpages: Vec<u32>,
}

impl Msgin {
    /// Creates reassembly state for a message of `length` bytes with an
    /// initial authorization of `granted` bytes.
    pub fn new(length: u32, granted: u32) -> Self {
        Self {
            length,
            recv_end: 0,
            gaps: SmallVec::new(),
            bytes_received: 0,
            granted: granted.min(length),
            bpages: Vec::new(),
        }
    }

    /// True once every byte of the message has arrived.
    pub fn complete(&self) -> bool {
        self.bytes_received == self.length
    }

    /// Bytes the peer is authorized to send but that have not arrived yet.
    pub fn granted_outstanding(&self) -> u32 {
        self.granted.saturating_sub(self.bytes_received)
    }

    /// True while the message is waiting for a pool reservation.
    pub fn stalled(&self) -> bool {
        self.bpages.is_empty() && self.length > 0
    }

    /// The byte range a RESEND should name: the oldest gap if one exists,
    /// otherwise the unreceived prefix of the granted range.
    pub fn resend_range(&self) -> (u32, u32) {
        match self.gaps.first() {
            Some(gap) => (gap.start, gap.end),
            None => (self.recv_end, self.granted.max(self.recv_end)),
        }
    }

    /// Transfers ownership of the assembled bpages to the caller (delivery
    /// to the user).
    pub fn take_bpages(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.bpages)
    }

    /// Offers the segment `[offset, offset + data.len())` to the message.
    ///
    /// Reserves the message's bpages on first use (all pages at once, since
    /// the length is known), splits or shrinks gaps covered by the segment,
    /// copies only the newly received byte ranges into the region, and
    /// advances the frontier. Replaying any mix of segments after completion
    /// changes nothing.
    pub fn accept(&mut self, region: &PoolRegion, offset: u32, data: &[u8], tick: u64) -> Accept {
        let seg_len = data.len() as u32;
        if seg_len == 0 || offset.checked_add(seg_len).is_none() {
            return Accept::Malformed;
        }
        let end = offset + seg_len;
        if end > self.length {
            return Accept::Malformed;
        }

        if self.bpages.is_empty() {
            let needed = (self.length as usize).div_ceil(BPAGE_SIZE);
            match region.alloc(needed) {
                Some(pages) => self.bpages = pages,
                None => return Accept::NoBuffers,
            }
        }

        // Newly received sub-ranges of [offset, end): the parts that fall
        // inside existing gaps, plus anything past the frontier.
        let mut fresh: SmallVec<[(u32, u32); 4]> = SmallVec::new();
        let mut gaps: SmallVec<[Gap; 4]> = SmallVec::new();
        for gap in self.gaps.drain(..) {
            let ov_start = offset.max(gap.start);
            let ov_end = end.min(gap.end);
            if ov_start >= ov_end {
                gaps.push(gap);
                continue;
            }
            fresh.push((ov_start, ov_end));
            if gap.start < ov_start {
                gaps.push(Gap { start: gap.start, end: ov_start, ..gap });
            }
            if ov_end < gap.end {
                gaps.push(Gap { start: ov_end, end: gap.end, ..gap });
            }
        }
        self.gaps = gaps;

        if end > self.recv_end {
            let start = offset.max(self.recv_end);
            fresh.push((start, end));
            if offset > self.recv_end {
                // Out-of-order arrival past the frontier opens a new hole.
                self.gaps.push(Gap {
                    start: self.recv_end,
                    end: offset,
                    first_seen_tick: tick,
                });
            }
            self.recv_end = end;
        }

        if fresh.is_empty() {
            return Accept::Duplicate;
        }

        let mut new_bytes = 0u32;
        for &(start, stop) in &fresh {
            self.copy_range(region, start, &data[(start - offset) as usize..(stop - offset) as usize]);
            new_bytes += stop - start;
        }
        self.bytes_received += new_bytes;
        debug_assert!(self.bytes_received <= self.length);
        debug_assert_eq!(
            self.bytes_received,
            self.recv_end - self.gaps.iter().map(|g| g.end - g.start).sum::<u32>()
        );

        Accept::Accepted { new_bytes, complete: self.complete() }
    }

    /// Copies one contiguous range into the bpages backing it, crossing
    /// bpage boundaries as needed.
    fn copy_range(&self, region: &PoolRegion, mut start: u32, mut data: &[u8]) {
        while !data.is_empty() {
            let page = (start >> BPAGE_SHIFT) as usize;
            let in_page = (start as usize) & (BPAGE_SIZE - 1);
            let chunk = data.len().min(BPAGE_SIZE - in_page);
            region.write(self.bpages[page], in_page, &data[..chunk]);
            start += chunk as u32;
            data = &data[chunk..];
        }
    }
}
