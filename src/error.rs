//! Transport error kinds.
//!
//! A [`HomaError`] is either returned directly from a user-facing call (bad
//! arguments, port collisions) or recorded as the sticky error of an RPC and
//! delivered through the receive path, the way the kernel transport surfaces
//! `ETIMEDOUT` and friends through `recvmsg`.

use thiserror::Error;

/// Errors surfaced by the transport.
///
/// The first group are per-RPC fatal errors: once set on an RPC they are
/// sticky, the RPC moves toward its terminal state, and any waiter observes
/// the error. The rest are local errors returned straight to the caller and
/// leave all RPC state untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HomaError {
    /// The peer stayed silent past `timeout_ticks`, or ignored too many
    /// RESENDs. The RPC is finished; the request may or may not have been
    /// executed remotely.
    #[error("RPC timed out waiting for peer")]
    TimedOut,

    /// The RPC was aborted locally before it completed.
    #[error("RPC canceled")]
    Canceled,

    /// The peer answered with RPC_UNKNOWN: it has no state for this RPC, so
    /// a response will never arrive.
    #[error("peer discarded its state for this RPC")]
    RpcUnknown,

    /// The socket was shut down while the operation was outstanding.
    #[error("socket has been shut down")]
    Shutdown,

    /// Zero-length message, or longer than `max_message_length`.
    #[error("message length out of range")]
    InvalidMessage,

    /// Explicit bind above the ephemeral boundary, or port 0 where a real
    /// port is required.
    #[error("port outside the bindable range")]
    InvalidPort,

    /// The requested port is already bound on this transport.
    #[error("port already in use")]
    PortInUse,

    /// The ephemeral port range is exhausted.
    #[error("no free client ports")]
    NoFreePorts,

    /// The receive buffer region is missing, or its length is not a positive
    /// multiple of the bpage size.
    #[error("receive buffer region absent or not a multiple of the bpage size")]
    BadRegion,

    /// No RPC with the given id is awaiting this operation (e.g. a response
    /// for an id that was never received, or was already answered).
    #[error("no matching RPC")]
    NoSuchRpc,
}
