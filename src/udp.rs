//! The UDP shell: carries Homa packets inside UDP datagrams.
//!
//! A [`UdpNode`] wraps one [`Homa`] transport instance around one UDP
//! socket. All Homa ports of the instance share that socket; the Homa
//! header's own port fields do the demultiplexing, UDP only provides
//! host-to-host datagram delivery (and its checksum). Every node in a
//! deployment listens on the same well-known UDP port, so a node is
//! addressed by its IP alone.
//!
//! [`UdpNode::handle_forever`] services packet receive and transmit in a
//! select loop and runs the timer tick from a background task on
//! `Config::tick_interval`.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::config::Config;
use crate::link::{ChannelSink, Datagram};
use crate::protocol::transport::Homa;

/// Largest datagram the receive loop accepts.
const MAX_DATAGRAM: usize = 64 * 1024;

/// Generates a local loopback IP address from a 16-bit host number.
/// Used for running multiple nodes on one machine (each node needs its own
/// address because all nodes share the carrier port); the 127.88.x.y range
/// keeps them out of the way of anything real.
pub fn generate_host_ip(hostnum: u16) -> String {
    format!("127.88.{}.{}", ((hostnum >> 8) & 0xFF) as u8, (hostnum & 0xFF) as u8)
}

/// Interface for the shells that connect a [`Homa`] instance to a real
/// network.
#[async_trait]
pub trait HomaNode: Send + Sync {
    /// The local address packets are sent from.
    fn local_ip(&self) -> IpAddr;

    /// The carrier port the node listens on.
    fn local_port(&self) -> u16;

    /// The transport instance, for binding sockets.
    fn transport(&self) -> Arc<Homa>;

    /// Runs the node until the carrier socket fails. Drives packet receive
    /// and transmit (the timer tick runs from a background task).
    async fn handle_forever(&self) -> io::Result<()>;
}

/// A Homa transport bound to a UDP socket.
pub struct UdpNode {
    homa: Arc<Homa>,
    socket: Arc<UdpSocket>,
    udp_port: u16,
    egress: tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>,
}

impl UdpNode {
    /// Binds a node to `ipstr` (of the form "ip:port"). All peers must use
    /// the same carrier port.
    pub async fn bind(ipstr: &str, config: Config) -> io::Result<UdpNode> {
        let addr: SocketAddr = ipstr.parse().map_err(|_| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "address must be of form ip:port")
        })?;
        let socket = UdpSocket::bind(addr).await?;
        let udp_port = socket.local_addr()?.port();
        info!("Homa/UDP node listening on {:?}", socket.local_addr()?);

        let (sink, egress) = ChannelSink::new();
        let homa = Homa::new(config, sink);

        // The tick task runs for as long as the transport itself lives.
        let tick_interval = homa.config.tick_interval;
        let weak = Arc::downgrade(&homa);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(homa) = weak.upgrade() else {
                    break;
                };
                homa.tick();
            }
            debug!("timer task finished");
        });

        Ok(UdpNode {
            homa,
            socket: Arc::new(socket),
            udp_port,
            egress: tokio::sync::Mutex::new(egress),
        })
    }
}

#[async_trait]
impl HomaNode for UdpNode {
    fn local_ip(&self) -> IpAddr {
        self.socket.local_addr().expect("bound socket has an address").ip()
    }

    fn local_port(&self) -> u16 {
        self.udp_port
    }

    fn transport(&self) -> Arc<Homa> {
        self.homa.clone()
    }

    async fn handle_forever(&self) -> io::Result<()> {
        let mut egress = self.egress.lock().await;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                outbound = egress.recv() => {
                    match outbound {
                        // Plain UDP has no per-packet QoS channel; the
                        // priority stops here.
                        Some(Datagram { dst, priority, bytes }) => {
                            trace!(%dst, priority, len = bytes.len(), "udp xmit");
                            let to = SocketAddr::new(dst, self.udp_port);
                            if let Err(e) = self.socket.send_to(&bytes, to).await {
                                debug!("udp send error: {e}");
                            }
                        }
                        None => return Ok(()),
                    }
                }
                inbound = self.socket.recv_from(&mut buf) => {
                    let (len, from) = inbound?;
                    self.homa.ingest(from.ip(), &buf[..len]);
                }
            }
        }
    }
}
