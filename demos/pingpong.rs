//! Two Homa/UDP nodes in one process exchanging one RPC.
//!
//! The nodes live on separate loopback addresses (127.88.0.x) because all
//! nodes of a deployment share the carrier UDP port. Run with
//! `cargo run --example pingpong`.

use std::net::SocketAddr;
use std::sync::Arc;

use homa_mamont::protocol::BPAGE_SIZE;
use homa_mamont::udp::{generate_host_ip, HomaNode, UdpNode};
use homa_mamont::{Config, RecvFilter};

const CARRIER_PORT: u16 = 4500;
const SERVER_PORT: u16 = 99;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt::init();

    let server_ip = generate_host_ip(1);
    let client_ip = generate_host_ip(2);

    let server_node =
        UdpNode::bind(&format!("{server_ip}:{CARRIER_PORT}"), Config::default()).await?;
    let client_node =
        UdpNode::bind(&format!("{client_ip}:{CARRIER_PORT}"), Config::default()).await?;

    let server_addr = SocketAddr::new(server_node.local_ip(), SERVER_PORT);
    let server = server_node.transport().bind(SERVER_PORT)?;
    server.set_buffer_region(16 * BPAGE_SIZE)?;
    let client = client_node.transport().bind(0)?;
    client.set_buffer_region(16 * BPAGE_SIZE)?;

    tokio::spawn(async move { server_node.handle_forever().await });
    tokio::spawn(async move { client_node.handle_forever().await });

    // Server: answer one request with its payload reversed.
    let server_task = tokio::spawn({
        let server = Arc::clone(&server);
        async move {
            let req = server.receive(RecvFilter::Request).await?;
            let mut body = server.message_bytes(&req)?;
            server.release_bpages(&req.bpages)?;
            body.reverse();
            server.send_response(req.source, req.id, &body)?;
            Ok::<(), anyhow::Error>(())
        }
    });

    let id = client.send_request(server_addr, b"ping, homa!", 7)?;
    let resp = client.receive(RecvFilter::Rpc(id)).await?;
    let body = client.message_bytes(&resp)?;
    client.release_bpages(&resp.bpages)?;
    println!("response for rpc {id} (cookie {}): {:?}", resp.cookie, String::from_utf8_lossy(&body));

    server_task.await??;
    Ok(())
}
