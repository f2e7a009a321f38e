//! Sockets: per-port state and the user-facing API.
//!
//! A [`HomaSocket`] owns everything scoped to one Homa port: the client and
//! server RPC tables, the list of live RPCs the timer walks, the dead-RPC
//! list awaiting the reaper, the receive buffer pool, and the queue of
//! completed messages waiting for a `receive` call.
//!
//! Receiving is zero-copy: a delivered [`RecvMessage`] names the bpages the
//! payload was assembled into, the user reads them straight out of the
//! registered region, and returns them with [`HomaSocket::release_bpages`]
//! once consumed.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::Notify;
use tracing::{debug, info};

use crate::error::HomaError;
use crate::protocol::msgout::Msgout;
use crate::protocol::pool::{BufferPool, PoolRegion};
use crate::protocol::rpc::{self, HomaRpc, RpcState};
use crate::protocol::transport::Homa;
use crate::protocol::{rpc_is_client, BPAGE_SIZE};

/// Selects which completed messages a `receive` call will accept.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecvFilter {
    /// Any completed message or failed RPC.
    Any,
    /// Only inbound requests (this end is the server).
    Request,
    /// Only responses to requests this end sent.
    Response,
    /// Only the RPC with this local id.
    Rpc(u64),
}

impl RecvFilter {
    fn matches(&self, id: u64) -> bool {
        match *self {
            RecvFilter::Any => true,
            RecvFilter::Request => !rpc_is_client(id),
            RecvFilter::Response => rpc_is_client(id),
            RecvFilter::Rpc(want) => id == want,
        }
    }
}

/// One delivered message (or one failed RPC).
///
/// When `error` is `None` the payload occupies the first `length` bytes of
/// `bpages` in order (the last page possibly partial); the bpages now belong
/// to the caller, who must return them with
/// [`HomaSocket::release_bpages`]. When `error` is set there is no payload
/// and no bpages change hands.
#[derive(Debug)]
pub struct RecvMessage {
    /// Local RPC id. Odd ids are requests to answer with `send_response`.
    pub id: u64,
    /// Peer address and Homa port.
    pub source: SocketAddr,
    /// Completion cookie passed to `send_request` (zero for requests).
    pub cookie: u64,
    /// Payload length in bytes.
    pub length: u32,
    /// Bpage indices holding the payload, in message order.
    pub bpages: Vec<u32>,
    /// Sticky error of a failed RPC, if any.
    pub error: Option<HomaError>,
}

pub(crate) struct SocketInner {
    pub(crate) client_rpcs: HashMap<u64, Arc<HomaRpc>>,
    pub(crate) server_rpcs: HashMap<(IpAddr, u64), Arc<HomaRpc>>,
    /// Every live RPC on this socket, walked by the timer.
    pub(crate) active: Vec<Arc<HomaRpc>>,
    /// Dead RPCs whose buffers the reaper has not finished freeing.
    pub(crate) dead: VecDeque<Arc<HomaRpc>>,
    /// Packet buffers held by `dead` in total.
    pub(crate) dead_skbs: usize,
    /// Completed (or failed) RPCs awaiting a `receive` call.
    pub(crate) ready: VecDeque<Arc<HomaRpc>>,
}

/// A Homa socket bound to one port.
pub struct HomaSocket {
    pub port: u16,
    pub(crate) transport: Weak<Homa>,
    pub(crate) pool: BufferPool,
    pub(crate) notify: Notify,
    shutdown: AtomicBool,
    inner: Mutex<SocketInner>,
}

impl HomaSocket {
    pub(crate) fn new(port: u16, transport: Weak<Homa>) -> Arc<Self> {
        Arc::new(Self {
            port,
            transport,
            pool: BufferPool::new(),
            notify: Notify::new(),
            shutdown: AtomicBool::new(false),
            inner: Mutex::new(SocketInner {
                client_rpcs: HashMap::new(),
                server_rpcs: HashMap::new(),
                active: Vec::new(),
                dead: VecDeque::new(),
                dead_skbs: 0,
                ready: VecDeque::new(),
            }),
        })
    }

    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, SocketInner> {
        self.inner.lock().expect("poisoned socket state")
    }

    pub(crate) fn wake(&self) {
        self.notify.notify_waiters();
    }

    fn transport(&self) -> Result<Arc<Homa>, HomaError> {
        self.transport.upgrade().ok_or(HomaError::Shutdown)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Registers the receive buffer region; `len` must be a positive
    /// multiple of [`BPAGE_SIZE`].
    pub fn set_buffer_region(&self, len: usize) -> Result<(), HomaError> {
        self.pool.set_region(len)?;
        info!(port = self.port, bpages = len / BPAGE_SIZE, "registered receive region");
        Ok(())
    }

    /// The registered region, for zero-copy reads of delivered bpages.
    pub fn buffer_region(&self) -> Result<Arc<PoolRegion>, HomaError> {
        self.pool.region().ok_or(HomaError::BadRegion)
    }

    /// Sends a request message to `dest` and returns the new RPC's id.
    /// `cookie` is echoed back in the eventual [`RecvMessage`].
    pub fn send_request(
        &self,
        dest: SocketAddr,
        body: &[u8],
        cookie: u64,
    ) -> Result<u64, HomaError> {
        let homa = self.transport()?;
        if self.is_shutdown() {
            return Err(HomaError::Shutdown);
        }
        if body.is_empty() || body.len() > homa.config.max_message_length as usize {
            return Err(HomaError::InvalidMessage);
        }
        let id = homa.next_client_id();
        let peer = homa.peers.lookup_or_create(dest.ip(), homa.current_tick());
        let msgout = Msgout::new(body, homa.max_seg_data(), homa.config.unsched_bytes);
        let rpc = HomaRpc::new_client(id, peer, dest.port(), self.port, cookie, msgout);
        {
            let mut inner = self.lock_inner();
            inner.client_rpcs.insert(id, rpc.clone());
            inner.active.push(rpc.clone());
        }
        debug!(id, dest = %dest, len = body.len(), "sending request");
        self.start_xmit(&homa, &rpc);
        Ok(id)
    }

    /// Sends the response for the server RPC `id` (as delivered by
    /// `receive`) back to `source`.
    pub fn send_response(
        &self,
        source: SocketAddr,
        id: u64,
        body: &[u8],
    ) -> Result<(), HomaError> {
        let homa = self.transport()?;
        if self.is_shutdown() {
            return Err(HomaError::Shutdown);
        }
        if body.is_empty() || body.len() > homa.config.max_message_length as usize {
            return Err(HomaError::InvalidMessage);
        }
        let rpc = self
            .lock_inner()
            .server_rpcs
            .get(&(source.ip(), id))
            .cloned()
            .ok_or(HomaError::NoSuchRpc)?;
        {
            let mut r = rpc.lock();
            if r.state != RpcState::InService {
                return Err(HomaError::NoSuchRpc);
            }
            r.msgout = Some(Msgout::new(body, homa.max_seg_data(), homa.config.unsched_bytes));
            r.state = RpcState::Outgoing;
            r.silent_ticks = 0;
            r.done_timer_tick = None;
        }
        debug!(id, dest = %source, len = body.len(), "sending response");
        self.start_xmit(&homa, &rpc);
        Ok(())
    }

    /// First transmission attempt for a fresh msgout; hands the RPC to the
    /// pacer if the link is congested.
    fn start_xmit(&self, homa: &Arc<Homa>, rpc: &Arc<HomaRpc>) {
        let mut r = rpc.lock();
        if rpc::xmit(homa, rpc, &mut r, false) && !r.throttled {
            r.throttled = true;
            let remaining =
                r.msgout.as_ref().map_or(0, |m| m.length - m.next_xmit_offset);
            homa.pacer.enqueue(rpc.clone(), remaining);
        }
    }

    /// Aborts the client RPC `id`: its state is torn down, in-flight packets
    /// are ignored by the peer once it learns of the abort, and the receive
    /// path reports [`HomaError::Canceled`].
    pub fn abort(&self, id: u64) -> Result<(), HomaError> {
        let homa = self.transport()?;
        let rpc = self
            .lock_inner()
            .client_rpcs
            .get(&id)
            .cloned()
            .ok_or(HomaError::NoSuchRpc)?;
        rpc::end(&homa, self, &rpc, Some(HomaError::Canceled));
        Ok(())
    }

    /// Non-blocking receive: the next completed message (or failed RPC)
    /// matching `filter`, if one is queued.
    pub fn try_receive(&self, filter: RecvFilter) -> Result<Option<RecvMessage>, HomaError> {
        if self.is_shutdown() {
            return Err(HomaError::Shutdown);
        }
        let (rpc, msg) = {
            let mut inner = self.lock_inner();
            let Some(pos) = inner.ready.iter().position(|r| filter.matches(r.id)) else {
                return Ok(None);
            };
            let rpc = inner.ready.remove(pos).expect("position just found");
            let mut r = rpc.lock();
            let source = SocketAddr::new(rpc.peer.addr, rpc.peer_port);
            if let Some(error) = r.error {
                let msg = RecvMessage {
                    id: rpc.id,
                    source,
                    cookie: r.cookie,
                    length: r.msgin.as_ref().map_or(0, |m| m.length),
                    bpages: Vec::new(),
                    error: Some(error),
                };
                (None, msg)
            } else {
                let cookie = r.cookie;
                let msgin = r.msgin.as_mut().expect("ready RPC has a message");
                let msg = RecvMessage {
                    id: rpc.id,
                    source,
                    cookie,
                    length: msgin.length,
                    bpages: msgin.take_bpages(),
                    error: None,
                };
                r.delivered = true;
                if !rpc.is_client() {
                    // The user now holds the request; the timer leaves the
                    // RPC alone until send_response.
                    r.state = RpcState::InService;
                }
                let client = rpc.is_client();
                drop(r);
                (client.then(|| rpc.clone()), msg)
            }
        };
        // A delivered response finishes its client RPC; this is also what
        // queues the acknowledgment that lets the server drop its state.
        if let Some(rpc) = rpc {
            if let Ok(homa) = self.transport() {
                rpc::end(&homa, self, &rpc, None);
            }
        }
        Ok(Some(msg))
    }

    /// Waits for and returns the next completed message (or failed RPC)
    /// matching `filter`.
    pub async fn receive(&self, filter: RecvFilter) -> Result<RecvMessage, HomaError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(msg) = self.try_receive(filter)? {
                return Ok(msg);
            }
            notified.as_mut().await;
        }
    }

    /// Copies a delivered message out of the region. Convenience for users
    /// that do not want to manage bpage slices themselves; the bpages still
    /// must be released afterwards.
    pub fn message_bytes(&self, msg: &RecvMessage) -> Result<Vec<u8>, HomaError> {
        let region = self.buffer_region()?;
        let mut out = Vec::with_capacity(msg.length as usize);
        let mut remaining = msg.length as usize;
        for &idx in &msg.bpages {
            let chunk = remaining.min(BPAGE_SIZE);
            out.extend_from_slice(&region.bpage(idx)[..chunk]);
            remaining -= chunk;
        }
        Ok(out)
    }

    /// Returns consumed bpages to the pool.
    pub fn release_bpages(&self, bpages: &[u32]) -> Result<(), HomaError> {
        let region = self.buffer_region()?;
        region.release(bpages);
        Ok(())
    }

    /// Marks every RPC for teardown and wakes all waiters. Further calls on
    /// the socket fail with [`HomaError::Shutdown`].
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(port = self.port, "socket shutting down");
        if let Ok(homa) = self.transport() {
            let active: Vec<_> = self.lock_inner().active.clone();
            for rpc in active {
                rpc::end(&homa, self, &rpc, Some(HomaError::Shutdown));
            }
        }
        self.wake();
    }

    /// Shuts the socket down, frees every buffer it still holds and removes
    /// it from the transport.
    pub fn destroy(&self) {
        self.shutdown();
        self.reap(usize::MAX);
        if let Ok(homa) = self.transport() {
            homa.unbind(self.port);
        }
    }

    /// Frees up to `budget` packet buffers from the dead-RPC list, dropping
    /// each RPC (and returning its undelivered bpages) once drained.
    /// Returns the packet buffers freed and the RPCs fully reaped.
    pub(crate) fn reap(&self, mut budget: usize) -> (usize, usize) {
        let region = self.pool.region();
        let mut freed_total = 0;
        let mut rpcs_reaped = 0;
        let mut inner = self.lock_inner();
        while let Some(rpc) = inner.dead.front().cloned() {
            let mut r = rpc.lock();
            let skbs = r.msgout.as_ref().map_or(0, |m| m.packets.len());
            let freed = skbs.min(budget);
            if freed > 0 {
                let mo = r.msgout.as_mut().expect("counted packets above");
                mo.packets.truncate(skbs - freed);
                inner.dead_skbs -= freed;
                budget -= freed;
                freed_total += freed;
            }
            if r.msgout.as_ref().map_or(0, |m| m.packets.len()) == 0 {
                if !r.delivered {
                    if let (Some(region), Some(msgin)) = (region.as_ref(), r.msgin.as_mut()) {
                        let bpages = msgin.take_bpages();
                        region.release(&bpages);
                    }
                }
                drop(r);
                inner.dead.pop_front();
                rpcs_reaped += 1;
                continue;
            }
            break;
        }
        (freed_total, rpcs_reaped)
    }

    /// Packet buffers currently held by dead RPCs (reaping backlog).
    pub fn dead_skbs(&self) -> usize {
        self.lock_inner().dead_skbs
    }

    /// Live RPCs on this socket.
    pub fn active_rpcs(&self) -> usize {
        self.lock_inner().active.len()
    }
}
