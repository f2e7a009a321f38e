//! The interface between the transport core and the OS network stack.
//!
//! The core emits packets from short critical sections (sometimes with RPC
//! or scheduler locks held), so a [`PacketSink`] must only enqueue: it never
//! blocks, never re-enters the transport, and reports nothing back. Delivery
//! failures are the network's business; the protocol already recovers from
//! loss through RESEND and retransmission.
//!
//! [`ChannelSink`] is the stock implementation: an unbounded channel whose
//! receiving end is drained by whatever actually owns the wire - the UDP
//! shell in production, the test harness in the test suite.

use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::mpsc;

/// One outbound packet, ready for the wire.
#[derive(Debug)]
pub struct Datagram {
    /// Destination host.
    pub dst: IpAddr,
    /// Priority level the link layer should map to its QoS mechanism
    /// (DSCP, VLAN PCP, ...). Carriers without one may ignore it.
    pub priority: u8,
    /// The full Homa packet, header and payload.
    pub bytes: Vec<u8>,
}

/// Where the transport core puts finished packets.
pub trait PacketSink: Send + Sync {
    /// Enqueues one packet toward `dst`. Must not block and must not call
    /// back into the transport.
    fn deliver(&self, dst: IpAddr, priority: u8, bytes: Vec<u8>);
}

/// A [`PacketSink`] backed by an unbounded channel.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Datagram>,
}

impl ChannelSink {
    /// Creates the sink and the receiver its packets arrive on.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Datagram>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl PacketSink for ChannelSink {
    fn deliver(&self, dst: IpAddr, priority: u8, bytes: Vec<u8>) {
        // A closed receiver means the shell is gone; the packet is as lost
        // as one dropped by a switch, and the protocol handles that.
        let _ = self.tx.send(Datagram { dst, priority, bytes });
    }
}
