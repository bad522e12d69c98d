//! Integration coverage for the Port Allocator: idempotent expose,
//! connection-hook accounting, splicing, and per-instance teardown, all
//! through the public `PortAllocator` API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use aegis::portalloc::{ConnectHook, PortAllocator};

async fn echo_upstream() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut sock, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 64];
                if let Ok(n) = sock.read(&mut buf).await {
                    let _ = sock.write_all(&buf[..n]).await;
                }
            });
        }
    });
    addr
}

fn noop_hook() -> ConnectHook {
    Arc::new(|_| {})
}

#[tokio::test]
async fn exposing_the_same_guest_port_twice_returns_the_same_host_port() {
    let alloc = PortAllocator::new();
    let upstream = echo_upstream().await;

    let first = alloc.expose("inst-a", 80, None, upstream, noop_hook()).await.unwrap();
    let second = alloc.expose("inst-a", 80, None, upstream, noop_hook()).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn different_instances_get_independent_host_ports_for_the_same_guest_port() {
    let alloc = PortAllocator::new();
    let upstream = echo_upstream().await;

    let a = alloc.expose("inst-a", 80, None, upstream, noop_hook()).await.unwrap();
    let b = alloc.expose("inst-b", 80, None, upstream, noop_hook()).await.unwrap();
    assert_ne!(a, b);

    let endpoints_a = alloc.endpoints("inst-a").await;
    let endpoints_b = alloc.endpoints("inst-b").await;
    assert_eq!(endpoints_a.get(&80), Some(&a));
    assert_eq!(endpoints_b.get(&80), Some(&b));
}

#[tokio::test]
async fn connecting_to_the_host_port_invokes_the_hook_and_splices_to_upstream() {
    let alloc = PortAllocator::new();
    let upstream = echo_upstream().await;
    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = hits.clone();
    let hook: ConnectHook = Arc::new(move |id| {
        assert_eq!(id, "inst-a");
        hits2.fetch_add(1, Ordering::SeqCst);
    });

    let host_port = alloc.expose("inst-a", 9000, None, upstream, hook).await.unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", host_port)).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unexpose_all_tears_down_every_mapping_for_an_instance_but_not_others() {
    let alloc = PortAllocator::new();
    let upstream = echo_upstream().await;

    alloc.expose("inst-a", 80, None, upstream, noop_hook()).await.unwrap();
    alloc.expose("inst-a", 443, None, upstream, noop_hook()).await.unwrap();
    alloc.expose("inst-b", 80, None, upstream, noop_hook()).await.unwrap();

    alloc.unexpose_all("inst-a").await;

    assert!(alloc.endpoints("inst-a").await.is_empty());
    assert_eq!(alloc.endpoints("inst-b").await.len(), 1);
}

#[tokio::test]
async fn unexpose_is_idempotent_and_frees_the_guest_port_for_reuse() {
    let alloc = PortAllocator::new();
    let upstream = echo_upstream().await;

    alloc.expose("inst-a", 80, None, upstream, noop_hook()).await.unwrap();
    alloc.unexpose("inst-a", 80).await;
    alloc.unexpose("inst-a", 80).await;

    let reexposed = alloc.expose("inst-a", 80, None, upstream, noop_hook()).await.unwrap();
    assert!(reexposed > 0);
}
