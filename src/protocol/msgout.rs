//! Outbound message fragmentation.
//!
//! A [`Msgout`] owns the payload of one outgoing message, pre-split into
//! MTU-derived segments. Transmission walks the segment list in offset
//! order; `next_xmit_offset` is the boundary between packets already handed
//! to the link and packets still waiting, and never passes the granted
//! window (`min(length, granted)`). The unscheduled prefix is granted from
//! the start, so short messages never wait.

/// One pre-built segment of an outgoing message.
pub struct OutPacket {
    /// Offset of the segment's first byte within the message.
    pub offset: u32,
    /// Segment payload. Cleared when the dead RPC holding it is reaped.
    pub payload: Vec<u8>,
}

/// Transmit state for one outgoing message.
pub struct Msgout {
    /// Total message length.
    pub length: u32,
    /// Segments in offset order. Entries keep their payload until reaped.
    pub packets: Vec<OutPacket>,
    /// Index into `packets` of the next segment to transmit.
    pub next_xmit: usize,
    /// Offset of the first byte not yet handed to the link.
    pub next_xmit_offset: u32,
    /// Cumulative bytes the receiver has authorized. Monotone, capped at
    /// `length`, starts at the unscheduled allowance.
    pub granted: u32,
    /// Size of the unscheduled prefix.
    pub unscheduled: u32,
    /// Priority to use for scheduled segments, from the latest GRANT.
    pub sched_priority: u8,
}

impl Msgout {
    /// Fragments `body` into segments of at most `max_seg` bytes.
    pub fn new(body: &[u8], max_seg: usize, unsched_bytes: u32) -> Self {
        let length = body.len() as u32;
        let mut packets = Vec::with_capacity(body.len().div_ceil(max_seg.max(1)));
        let mut offset = 0usize;
        while offset < body.len() {
            let end = (offset + max_seg).min(body.len());
            packets.push(OutPacket { offset: offset as u32, payload: body[offset..end].to_vec() });
            offset = end;
        }
        Self {
            length,
            packets,
            next_xmit: 0,
            next_xmit_offset: 0,
            granted: unsched_bytes.min(length),
            unscheduled: unsched_bytes.min(length),
            sched_priority: 0,
        }
    }

    /// Highest offset currently transmittable.
    pub fn xmit_limit(&self) -> u32 {
        self.granted.min(self.length)
    }

    /// True once every byte has been handed to the link at least once.
    pub fn fully_transmitted(&self) -> bool {
        self.next_xmit_offset >= self.length
    }

    /// Raises the granted window to `offset` (monotone, capped at the
    /// message length). Returns true if the window actually moved.
    pub fn register_grant(&mut self, offset: u32) -> bool {
        let new = offset.min(self.length);
        if new > self.granted {
            self.granted = new;
            return true;
        }
        false
    }

    /// Indices of the segments overlapping `[offset, offset + length)` that
    /// have been transmitted before, for retransmission.
    pub fn xmitted_range(&self, offset: u32, length: u32) -> std::ops::Range<usize> {
        let end = offset.saturating_add(length).min(self.next_xmit_offset);
        if offset >= end {
            return 0..0;
        }
        let first = self.packets.partition_point(|p| {
            p.offset + p.payload.len() as u32 <= offset
        });
        let last = self.packets.partition_point(|p| p.offset < end);
        first..last
    }
}
