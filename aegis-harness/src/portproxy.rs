//! In-guest port proxy: bridges the guest NIC address to `127.0.0.1` for
//! apps that bind only to loopback.
//!
//! Started immediately before the primary process, one task per declared
//! expose port. Each waits, with a growing poll interval, up to five
//! minutes for *something* to be listening; if the app already binds the
//! guest NIC address directly no proxy is needed, and if it never comes up
//! the wait gives up silently rather than failing the boot.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;

use crate::klog::log;

const MAX_WAIT: Duration = Duration::from_secs(5 * 60);
const INITIAL_POLL: Duration = Duration::from_millis(200);
const MAX_POLL: Duration = Duration::from_secs(5);

/// Spawns one proxy-setup task per port; each either finds the port
/// already reachable, starts a forwarding listener, or times out quietly.
pub fn start_all(guest_ip: std::net::IpAddr, ports: &[u16]) {
    for &port in ports {
        tokio::spawn(establish(guest_ip, port));
    }
}

async fn establish(guest_ip: std::net::IpAddr, port: u16) {
    let guest_addr = SocketAddr::new(guest_ip, port);
    let loopback_addr = SocketAddr::from(([127, 0, 0, 1], port));

    let deadline = Instant::now() + MAX_WAIT;
    let mut interval = INITIAL_POLL;

    loop {
        if TcpStream::connect(guest_addr).await.is_ok() {
            log(&format!("port {port} already reachable on guest NIC, no proxy needed"));
            return;
        }
        if TcpStream::connect(loopback_addr).await.is_ok() {
            match TcpListener::bind(guest_addr).await {
                Ok(listener) => {
                    log(&format!("proxying {guest_addr} -> {loopback_addr}"));
                    tokio::spawn(accept_loop(listener, loopback_addr));
                }
                Err(e) => log(&format!("failed to bind proxy listener on {guest_addr}: {e}")),
            }
            return;
        }
        if Instant::now() >= deadline {
            log(&format!("port {port} never became reachable, giving up on proxy"));
            return;
        }
        tokio::time::sleep(interval).await;
        interval = (interval * 2).min(MAX_POLL);
    }
}

async fn accept_loop(listener: TcpListener, target: SocketAddr) {
    loop {
        let Ok((inbound, _)) = listener.accept().await else {
            continue;
        };
        tokio::spawn(async move {
            match TcpStream::connect(target).await {
                Ok(outbound) => {
                    let mut inbound = inbound;
                    let mut outbound = outbound;
                    let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
                }
                Err(e) => log(&format!("proxy dial to {target} failed: {e}")),
            }
        });
    }
}
