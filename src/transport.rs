//! Transport: the JSON-RPC connection actor that sits between the
//! Lifecycle Manager and one guest harness.
//!
//! A `Transport` owns one TCP connection end-to-end: a reader task that
//! demultiplexes inbound `Frame`s (correlating responses to host-issued
//! requests, forwarding guest-issued requests and notifications to the
//! caller), and a writer task that serializes all outbound frames onto
//! the wire. Callers never touch the socket directly — they go through
//! [`Transport::call`] / [`Transport::notify`] and drain [`Inbound`]
//! events from the channel returned by `Transport::connect`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;

use aegis_protocol::{Frame, FrameReader, FrameWriter, RpcError, RpcId, RpcRequest, RpcResponse};

use crate::error::{Error, Result};

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Something the guest harness sent that isn't a response to a
/// host-issued request: either a request of its own (e.g. `guest.spawn`,
/// which expects a reply) or a fire-and-forget notification (`log`,
/// `activity`, `processExited`, ...).
pub enum Inbound {
    Request {
        method: String,
        params: Value,
        responder: oneshot::Sender<std::result::Result<Value, RpcError>>,
    },
    Notification {
        method: String,
        params: Value,
    },
}

struct Pending {
    tx: oneshot::Sender<RpcResponse>,
}

/// One live connection to a guest harness.
pub struct Transport {
    next_id: std::sync::atomic::AtomicI64,
    pending: Mutex<HashMap<RpcId, Pending>>,
    out_tx: mpsc::UnboundedSender<Frame>,
    closed: Arc<tokio::sync::Notify>,
}

impl Transport {
    /// Bind a listener on an ephemeral loopback port and wait for the
    /// guest harness to dial back within `boot_timeout`. Returns the
    /// bound address (to inject into
    /// `VmSpec.kernel_args["AEGIS_HOST_ADDR"]`) and a future that
    /// resolves once the harness connects.
    pub async fn bind_ephemeral() -> Result<(SocketAddr, TcpListener)> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(Error::Io)?;
        let addr = listener.local_addr().map_err(Error::Io)?;
        Ok((addr, listener))
    }

    /// Accept the one connection a freshly booted harness makes, with a
    /// timeout (boot-timeout default of 60s, owned by the caller).
    pub async fn accept(listener: TcpListener, boot_timeout: Duration) -> Result<TcpStream> {
        let (stream, _peer) = timeout(boot_timeout, listener.accept())
            .await
            .map_err(|_| Error::Timeout("harness did not connect before boot timeout".into()))?
            .map_err(Error::Io)?;
        Ok(stream)
    }

    /// Take ownership of an established connection and spin up the
    /// reader/writer actor tasks. Returns the handle plus a channel of
    /// [`Inbound`] events the caller must keep draining.
    pub fn spawn(stream: TcpStream) -> (Arc<Transport>, mpsc::UnboundedReceiver<Inbound>) {
        let (read_half, write_half) = stream.into_split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Inbound>();

        let transport = Arc::new(Transport {
            next_id: std::sync::atomic::AtomicI64::new(1),
            pending: Mutex::new(HashMap::new()),
            out_tx: out_tx.clone(),
            closed: Arc::new(tokio::sync::Notify::new()),
        });

        tokio::spawn(async move {
            let mut writer = FrameWriter::new(write_half);
            while let Some(frame) = out_rx.recv().await {
                if writer.write_frame(&frame).await.is_err() {
                    break;
                }
            }
        });

        let reader_transport = transport.clone();
        tokio::spawn(async move {
            let mut reader = FrameReader::new(BufReader::new(read_half));
            loop {
                let frame = match reader.next_frame().await {
                    Ok(Some(f)) => f,
                    _ => break,
                };
                match frame {
                    Frame::Response(resp) => {
                        let pending = reader_transport.pending.lock().await.remove(&resp.id);
                        if let Some(pending) = pending {
                            let _ = pending.tx.send(resp);
                        }
                    }
                    Frame::Request(req) => {
                        if let Some(id) = req.id.clone() {
                            let (tx, rx) = oneshot::channel();
                            if inbound_tx
                                .send(Inbound::Request {
                                    method: req.method.clone(),
                                    params: req.params.clone(),
                                    responder: tx,
                                })
                                .is_err()
                            {
                                break;
                            }
                            let out_tx = reader_transport.out_tx.clone();
                            tokio::spawn(async move {
                                if let Ok(result) = rx.await {
                                    let resp = match result {
                                        Ok(value) => RpcResponse::ok(id, value),
                                        Err(e) => RpcResponse::err(id, e),
                                    };
                                    let _ = out_tx.send(Frame::Response(resp));
                                }
                            });
                        } else if inbound_tx
                            .send(Inbound::Notification {
                                method: req.method,
                                params: req.params,
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
            reader_transport.closed.notify_waiters();
            // Drop every pending call so callers get a `Transport` error
            // instead of hanging forever on a dead connection.
            reader_transport.pending.lock().await.clear();
        });

        (transport, inbound_rx)
    }

    fn alloc_id(&self) -> RpcId {
        RpcId::Number(self.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst))
    }

    /// Issue a request to the guest harness and await its response,
    /// capped at `DEFAULT_CALL_TIMEOUT`.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.call_with_timeout(method, params, DEFAULT_CALL_TIMEOUT)
            .await
    }

    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout_dur: Duration,
    ) -> Result<Value> {
        let id = self.alloc_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), Pending { tx });

        let req = RpcRequest::request(id.clone(), method, params);
        if self.out_tx.send(Frame::Request(req)).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(Error::Transport("connection closed".into()));
        }

        let resp = match timeout(timeout_dur, rx).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(_)) => return Err(Error::Transport("connection closed".into())),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(Error::Timeout(format!("{method} timed out")));
            }
        };

        match resp.error {
            Some(e) => Err(Error::Transport(format!("{method} failed: {}", e.message))),
            None => Ok(resp.result.unwrap_or(Value::Null)),
        }
    }

    /// Send a fire-and-forget notification to the guest harness.
    pub fn notify(&self, method: &str, params: Value) -> Result<()> {
        self.out_tx
            .send(Frame::Request(RpcRequest::notification(method, params)))
            .map_err(|_| Error::Transport("connection closed".into()))
    }

    /// Resolves once the reader task observes EOF or a framing error.
    pub async fn closed(&self) {
        self.closed.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_protocol::method;
    use serde_json::json;

    async fn connected_pair() -> (Arc<Transport>, mpsc::UnboundedReceiver<Inbound>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client_fut = TcpStream::connect(addr);
        let (accepted, client) = tokio::join!(listener.accept(), client_fut);
        let (stream, _) = accepted.unwrap();
        let client = client.unwrap();
        let (transport, inbound) = Transport::spawn(stream);
        (transport, inbound, client)
    }

    #[tokio::test]
    async fn call_round_trips_with_matching_id() {
        let (transport, _inbound, mut client) = connected_pair().await;

        let call = tokio::spawn({
            let transport = transport.clone();
            async move { transport.call(method::HEALTH, json!({})).await }
        });

        let mut reader = FrameReader::new(BufReader::new(&mut client));
        let frame = reader.next_frame().await.unwrap().unwrap();
        let req = match frame {
            Frame::Request(r) => r,
            _ => panic!("expected request"),
        };
        assert_eq!(req.method, method::HEALTH);

        let mut writer = FrameWriter::new(&mut client);
        let resp = RpcResponse::ok(req.id.unwrap(), json!({"primary_running": true, "uptime_secs": 1}));
        writer.write_frame(&Frame::Response(resp)).await.unwrap();

        let result = call.await.unwrap().unwrap();
        assert_eq!(result["primary_running"], json!(true));
    }

    #[tokio::test]
    async fn call_times_out_when_no_response_arrives() {
        let (transport, _inbound, _client) = connected_pair().await;
        let err = transport
            .call_with_timeout(method::HEALTH, json!({}), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn inbound_request_from_guest_is_delivered_and_answered() {
        let (_transport, mut inbound, mut client) = connected_pair().await;

        let mut writer = FrameWriter::new(&mut client);
        let req = RpcRequest::request(RpcId::Number(1), method::GUEST_SPAWN, json!({"command": ["sleep"]}));
        writer.write_frame(&Frame::Request(req)).await.unwrap();

        match inbound.recv().await.unwrap() {
            Inbound::Request {
                method,
                responder,
                ..
            } => {
                assert_eq!(method, method::GUEST_SPAWN);
                responder.send(Ok(json!({"id": "child-1", "spawn_depth": 0}))).unwrap();
            }
            Inbound::Notification { .. } => panic!("expected request"),
        }

        let mut reader = FrameReader::new(BufReader::new(&mut client));
        let frame = reader.next_frame().await.unwrap().unwrap();
        match frame {
            Frame::Response(resp) => assert_eq!(resp.id, RpcId::Number(1)),
            Frame::Request(_) => panic!("expected response"),
        }
    }

    #[tokio::test]
    async fn notification_from_guest_is_delivered_without_a_response() {
        let (_transport, mut inbound, mut client) = connected_pair().await;
        let mut writer = FrameWriter::new(&mut client);
        let note = RpcRequest::notification(method::LOG, json!({"stream": "stdout", "line": "hi"}));
        writer.write_frame(&Frame::Request(note)).await.unwrap();

        match inbound.recv().await.unwrap() {
            Inbound::Notification { method, .. } => assert_eq!(method, method::LOG),
            Inbound::Request { .. } => panic!("expected notification"),
        }
    }
}
