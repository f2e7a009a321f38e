//! Homa Mamont - a userspace implementation of the Homa transport protocol in Rust
//!
//! Homa is a message-oriented, connectionless transport designed for datacenter
//! RPC. Unlike TCP it preserves message boundaries, binds every message to a
//! request/response pair (an RPC), favors short messages through priorities,
//! and keeps tail latency low under load by granting receive bandwidth to the
//! shortest remaining messages first.
//!
//! ## Main Components
//!
//! - `protocol`: the transport core - the RPC state machine, inbound message
//!   reassembly, outbound fragmentation, the grant scheduler, the pacer, the
//!   peer table, the receive buffer pool, and the periodic timer that drives
//!   retransmission, timeouts and reaping.
//!
//! - `link`: the [`link::PacketSink`] interface through which the core hands
//!   finished packets to the OS network stack. The core never talks to a
//!   socket directly; any transport that can carry a datagram will do.
//!
//! - `udp`: a Tokio-based shell that carries Homa packets inside UDP
//!   datagrams, feeds received datagrams to the dispatcher, and runs the
//!   timer tick. This is the piece most applications embed.
//!
//! - `config`: every tunable of the transport (resend/timeout tick counts,
//!   unscheduled byte allowance, grant window, pacer thresholds, priority
//!   cutoffs) with the defaults the protocol was tuned with.
//!
//! ## Usage
//!
//! Create a [`udp::UdpNode`] (or wire a [`Homa`] instance to your own
//! [`link::PacketSink`]), bind a [`HomaSocket`], register a receive buffer
//! region, and exchange messages with `send_request` / `receive` /
//! `send_response`.

pub mod config;
pub mod error;
pub mod link;
pub mod protocol;
pub mod udp;

pub use config::Config;
pub use error::HomaError;
pub use protocol::socket::{HomaSocket, RecvFilter, RecvMessage};
pub use protocol::transport::Homa;
pub use protocol::wire;
