//! Packet header layouts for the Homa wire protocol.
//!
//! Every Homa packet begins with a 16-byte common header carrying the source
//! and destination Homa ports, the header length, the packet type and the
//! sender's RPC id. The per-type headers below extend it. All multi-byte
//! fields are big-endian, and every header is padded to a multiple of four
//! bytes so `doff` (header length in 4-byte units) is always exact.
//!
//! The id carried in `sender_id` is the RPC id from the *sender's*
//! perspective; a receiver flips the low bit to obtain its own id for the
//! same RPC (see [`crate::protocol::local_id`]).

// Keep the protocol's own struct naming for the on-the-wire types, for
// consistency with its specification.
#![allow(non_camel_case_types)]

use std::io::{Cursor, Read, Write};

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::cast::FromPrimitive;

use super::{deserialize, invalid_data, Deserialize, Serialize};
use crate::protocol::NUM_PRIORITIES;
use crate::{DeserializeEnum, DeserializeStruct, SerializeEnum, SerializeStruct};

/// Discriminants for the `type` field of the common header.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum packet_type {
    /// A segment of message payload.
    #[default]
    DATA = 0x10,
    /// Authorizes the peer to send up to a cumulative offset.
    GRANT = 0x11,
    /// Asks the peer to retransmit a byte range.
    RESEND = 0x12,
    /// Tells the peer this end has no state for the named RPC.
    RPC_UNKNOWN = 0x13,
    /// Liveness signal: the RPC exists but there is nothing to send yet.
    BUSY = 0x14,
    /// Publishes the receiver's priority cutoffs for unscheduled traffic.
    CUTOFFS = 0x15,
    /// Debug only: asks the peer to freeze its internal trace.
    FREEZE = 0x16,
    /// Asks the client to acknowledge a completed RPC explicitly.
    NEED_ACK = 0x17,
    /// Carries explicit acknowledgments of completed RPCs.
    ACK = 0x18,
}
SerializeEnum!(packet_type);
DeserializeEnum!(packet_type);

/// The 16-byte header every Homa packet starts with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct common_hdr {
    /// Sender's Homa port.
    pub sport: u16,
    /// Receiver's Homa port.
    pub dport: u16,
    /// Total header length in 4-byte units; payload (DATA only) starts here.
    pub doff: u8,
    /// Packet type discriminant.
    pub ptype: packet_type,
    /// Optional end-to-end checksum; this implementation writes zero and
    /// relies on the carrier's checksum.
    pub checksum: u16,
    /// RPC id from the sender's perspective.
    pub sender_id: u64,
}
SerializeStruct!(common_hdr, sport, dport, doff, ptype, checksum, sender_id);
DeserializeStruct!(common_hdr, sport, dport, doff, ptype, checksum, sender_id);

impl common_hdr {
    pub const LEN: usize = 16;

    pub fn new(ptype: packet_type, sport: u16, dport: u16, sender_id: u64, doff: u8) -> Self {
        Self { sport, dport, doff, ptype, checksum: 0, sender_id }
    }
}

/// Header for DATA packets. The segment payload follows the header, starting
/// at `doff * 4`; its length is implicit in the packet length.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct data_hdr {
    pub common: common_hdr,
    /// Total length of the message this segment belongs to.
    pub message_length: u32,
    /// Cumulative bytes of the message the sender is currently authorized to
    /// transmit (unscheduled allowance plus received grants).
    pub incoming: u32,
    /// Version of the receiver's priority cutoffs the sender last saw; a
    /// mismatch makes the receiver publish fresh CUTOFFS.
    pub cutoff_version: u16,
    /// Nonzero if this segment is a retransmission.
    pub retransmit: u8,
    pub pad: u8,
    /// Offset of this segment's first byte within the message.
    pub offset: u32,
}
SerializeStruct!(
    data_hdr,
    common,
    message_length,
    incoming,
    cutoff_version,
    retransmit,
    pad,
    offset
);
DeserializeStruct!(
    data_hdr,
    common,
    message_length,
    incoming,
    cutoff_version,
    retransmit,
    pad,
    offset
);

impl data_hdr {
    pub const LEN: usize = 32;
    pub const DOFF: u8 = (Self::LEN / 4) as u8;
}

/// Header for GRANT packets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct grant_hdr {
    pub common: common_hdr,
    /// New cumulative authorized offset. Grants are monotone: a receiver of
    /// a smaller offset than already held ignores it.
    pub offset: u32,
    /// Priority the sender should use for the granted bytes.
    pub priority: u8,
    /// Nonzero asks the peer to retransmit everything it has already sent,
    /// used after the granting side lost state.
    pub resend_all: u8,
    pub pad: [u8; 2],
}
SerializeStruct!(grant_hdr, common, offset, priority, resend_all, pad);
DeserializeStruct!(grant_hdr, common, offset, priority, resend_all, pad);

impl grant_hdr {
    pub const LEN: usize = 24;
    pub const DOFF: u8 = (Self::LEN / 4) as u8;
}

/// Header for RESEND packets, naming a byte range the sender is missing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct resend_hdr {
    pub common: common_hdr,
    /// First missing byte.
    pub offset: u32,
    /// Number of missing bytes.
    pub length: u32,
    /// Priority the retransmitted data should use.
    pub priority: u8,
    pub pad: [u8; 3],
}
SerializeStruct!(resend_hdr, common, offset, length, priority, pad);
DeserializeStruct!(resend_hdr, common, offset, length, priority, pad);

impl resend_hdr {
    pub const LEN: usize = 28;
    pub const DOFF: u8 = (Self::LEN / 4) as u8;
}

/// Header for CUTOFFS packets, publishing the sender's unscheduled-priority
/// table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct cutoffs_hdr {
    pub common: common_hdr,
    /// `unsched_cutoffs[p]` is the largest message allowed to use priority
    /// `p` for its unscheduled bytes when sending to this host.
    pub unsched_cutoffs: [u32; NUM_PRIORITIES],
    /// Version tag echoed back in DATA headers.
    pub cutoff_version: u16,
    pub pad: [u8; 2],
}
SerializeStruct!(cutoffs_hdr, common, unsched_cutoffs, cutoff_version, pad);
DeserializeStruct!(cutoffs_hdr, common, unsched_cutoffs, cutoff_version, pad);

impl cutoffs_hdr {
    pub const LEN: usize = 52;
    pub const DOFF: u8 = (Self::LEN / 4) as u8;
}

/// One explicit acknowledgment: the client-side id of a completed RPC plus
/// the server port it was addressed to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct homa_ack {
    pub client_id: u64,
    pub server_port: u16,
    pub pad: [u8; 2],
}
SerializeStruct!(homa_ack, client_id, server_port, pad);
DeserializeStruct!(homa_ack, client_id, server_port, pad);

impl homa_ack {
    pub const LEN: usize = 12;

    pub fn new(client_id: u64, server_port: u16) -> Self {
        Self { client_id, server_port, pad: [0; 2] }
    }
}

/// Header for ACK packets: a counted list of [`homa_ack`] entries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ack_hdr {
    pub common: common_hdr,
    pub acks: Vec<homa_ack>,
}

impl ack_hdr {
    /// Header length for a given number of acks, for `doff` computation.
    pub fn len_for(num_acks: usize) -> usize {
        common_hdr::LEN + 4 + num_acks * homa_ack::LEN
    }

    pub fn doff_for(num_acks: usize) -> u8 {
        (Self::len_for(num_acks) / 4) as u8
    }
}

impl Serialize for ack_hdr {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        self.common.serialize(dest)?;
        (self.acks.len() as u16).serialize(dest)?;
        0u16.serialize(dest)?;
        for ack in &self.acks {
            ack.serialize(dest)?;
        }
        Ok(())
    }
}

impl Deserialize for ack_hdr {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        self.common.deserialize(src)?;
        let mut num_acks: u16 = 0;
        num_acks.deserialize(src)?;
        let mut pad: u16 = 0;
        pad.deserialize(src)?;
        self.acks.clear();
        for _ in 0..num_acks {
            self.acks.push(deserialize(src)?);
        }
        Ok(())
    }
}

macro_rules! BodylessHdr {
    ($t:ident) => {
        /// Header with no body beyond the common header.
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
        pub struct $t {
            pub common: common_hdr,
        }
        SerializeStruct!($t, common);
        DeserializeStruct!($t, common);

        impl $t {
            pub const LEN: usize = common_hdr::LEN;
            pub const DOFF: u8 = (Self::LEN / 4) as u8;
        }
    };
}

BodylessHdr!(rpc_unknown_hdr);
BodylessHdr!(busy_hdr);
BodylessHdr!(freeze_hdr);
BodylessHdr!(need_ack_hdr);

/// A fully parsed inbound packet.
#[derive(Clone, Debug)]
pub enum Packet {
    Data { hdr: data_hdr, payload: Vec<u8> },
    Grant(grant_hdr),
    Resend(resend_hdr),
    RpcUnknown(rpc_unknown_hdr),
    Busy(busy_hdr),
    Cutoffs(cutoffs_hdr),
    Freeze(freeze_hdr),
    NeedAck(need_ack_hdr),
    Ack(ack_hdr),
}

impl Packet {
    /// The common header shared by every packet type.
    pub fn common(&self) -> &common_hdr {
        match self {
            Packet::Data { hdr, .. } => &hdr.common,
            Packet::Grant(h) => &h.common,
            Packet::Resend(h) => &h.common,
            Packet::RpcUnknown(h) => &h.common,
            Packet::Busy(h) => &h.common,
            Packet::Cutoffs(h) => &h.common,
            Packet::Freeze(h) => &h.common,
            Packet::NeedAck(h) => &h.common,
            Packet::Ack(h) => &h.common,
        }
    }
}

/// Parses one datagram into a [`Packet`].
///
/// Rejects truncated headers, unknown packet types and DATA packets whose
/// `doff` points outside the datagram. The caller drops rejected packets and
/// bumps a counter; a malformed packet never mutates transport state.
pub fn parse_packet(buf: &[u8]) -> std::io::Result<Packet> {
    let mut cursor = Cursor::new(buf);
    let common: common_hdr = deserialize(&mut cursor)?;

    let mut cursor = Cursor::new(buf);
    match common.ptype {
        packet_type::DATA => {
            let hdr: data_hdr = deserialize(&mut cursor)?;
            let payload_start = usize::from(hdr.common.doff) * 4;
            if payload_start < data_hdr::LEN || payload_start > buf.len() {
                return Err(invalid_data("DATA doff outside packet"));
            }
            Ok(Packet::Data { hdr, payload: buf[payload_start..].to_vec() })
        }
        packet_type::GRANT => Ok(Packet::Grant(deserialize(&mut cursor)?)),
        packet_type::RESEND => Ok(Packet::Resend(deserialize(&mut cursor)?)),
        packet_type::RPC_UNKNOWN => Ok(Packet::RpcUnknown(deserialize(&mut cursor)?)),
        packet_type::BUSY => Ok(Packet::Busy(deserialize(&mut cursor)?)),
        packet_type::CUTOFFS => Ok(Packet::Cutoffs(deserialize(&mut cursor)?)),
        packet_type::FREEZE => Ok(Packet::Freeze(deserialize(&mut cursor)?)),
        packet_type::NEED_ACK => Ok(Packet::NeedAck(deserialize(&mut cursor)?)),
        packet_type::ACK => Ok(Packet::Ack(deserialize(&mut cursor)?)),
    }
}

/// Serializes a header (or header + payload already appended by the caller)
/// into a fresh buffer. Writing into a `Vec` cannot fail.
pub fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    value.serialize(&mut buf).expect("serializing into a Vec cannot fail");
    buf
}

/// Byte offset of the checksum field within the common header.
const CHECKSUM_OFFSET: usize = 6;

/// Ones'-complement sum over the packet with the checksum field read as
/// zero, folded to 16 bits (the internet checksum).
fn packet_checksum(buf: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut i = 0;
    while i < buf.len() {
        let hi = buf[i] as u32;
        let lo = if i + 1 < buf.len() { buf[i + 1] as u32 } else { 0 };
        if i != CHECKSUM_OFFSET {
            sum += (hi << 8) | lo;
        }
        i += 2;
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Computes and stores the checksum of a finished packet. A computed value
/// of zero is written as `0xffff` so that zero keeps meaning "no checksum".
pub fn install_checksum(buf: &mut [u8]) {
    if buf.len() < common_hdr::LEN {
        return;
    }
    let sum = match packet_checksum(buf) {
        0 => 0xffff,
        sum => sum,
    };
    buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&sum.to_be_bytes());
}

/// Verifies a packet's checksum. The field is optional: zero means the
/// sender did not compute one and the packet is accepted as-is.
pub fn verify_checksum(buf: &[u8]) -> bool {
    if buf.len() < common_hdr::LEN {
        // Too short to carry the field; the parser rejects it anyway.
        return true;
    }
    let stored = u16::from_be_bytes([buf[CHECKSUM_OFFSET], buf[CHECKSUM_OFFSET + 1]]);
    if stored == 0 {
        return true;
    }
    let computed = match packet_checksum(buf) {
        0 => 0xffff,
        sum => sum,
    };
    stored == computed
}
