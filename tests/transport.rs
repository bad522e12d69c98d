//! Integration coverage for the JSON-RPC `Transport` actor: boot-style
//! bind/accept, request/response correlation, inbound guest requests, and
//! disconnect handling, exercised over a real loopback socket pair.

use std::time::Duration;

use serde_json::json;
use tokio::io::BufReader;
use tokio::net::TcpStream;

use aegis::error::Error;
use aegis::transport::{Inbound, Transport};
use aegis_protocol::{method, Frame, FrameReader, FrameWriter, RpcId, RpcRequest, RpcResponse};

#[tokio::test]
async fn bind_ephemeral_then_accept_completes_once_a_peer_dials_in() {
    let (addr, listener) = Transport::bind_ephemeral().await.unwrap();
    let dialer = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });

    let accepted = Transport::accept(listener, Duration::from_secs(2)).await;
    assert!(accepted.is_ok());
    dialer.await.unwrap();
}

#[tokio::test]
async fn accept_times_out_when_nobody_dials() {
    let (_addr, listener) = Transport::bind_ephemeral().await.unwrap();
    let err = Transport::accept(listener, Duration::from_millis(50)).await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
}

async fn connected_pair() -> (std::sync::Arc<Transport>, tokio::sync::mpsc::UnboundedReceiver<Inbound>, TcpStream) {
    let (addr, listener) = Transport::bind_ephemeral().await.unwrap();
    let dial = TcpStream::connect(addr);
    let accept = Transport::accept(listener, Duration::from_secs(2));
    let (client, server) = tokio::join!(dial, accept);
    let (transport, inbound) = Transport::spawn(server.unwrap());
    (transport, inbound, client.unwrap())
}

#[tokio::test]
async fn host_issued_call_is_answered_by_the_peer() {
    let (transport, _inbound, mut peer) = connected_pair().await;

    let call = tokio::spawn({
        let transport = transport.clone();
        async move { transport.call(method::HEALTH, json!({})).await }
    });

    let mut reader = FrameReader::new(BufReader::new(&mut peer));
    let frame = reader.next_frame().await.unwrap().unwrap();
    let req = match frame {
        Frame::Request(r) => r,
        Frame::Response(_) => panic!("expected a request"),
    };
    assert_eq!(req.method, method::HEALTH);

    let mut writer = FrameWriter::new(&mut peer);
    let resp = RpcResponse::ok(req.id.unwrap(), json!({"primary_running": false, "uptime_secs": 0}));
    writer.write_frame(&Frame::Response(resp)).await.unwrap();

    let result = call.await.unwrap().unwrap();
    assert_eq!(result["primary_running"], json!(false));
}

#[tokio::test]
async fn peer_issued_request_is_surfaced_and_the_responder_replies_on_the_wire() {
    let (_transport, mut inbound, mut peer) = connected_pair().await;

    let mut writer = FrameWriter::new(&mut peer);
    let req = RpcRequest::request(RpcId::Number(7), method::GUEST_SPAWN, json!({"command": ["echo", "hi"]}));
    writer.write_frame(&Frame::Request(req)).await.unwrap();

    match inbound.recv().await.unwrap() {
        Inbound::Request { method: m, responder, .. } => {
            assert_eq!(m, method::GUEST_SPAWN);
            responder.send(Ok(json!({"id": "child-1", "spawn_depth": 0}))).unwrap();
        }
        Inbound::Notification { .. } => panic!("expected a request"),
    }

    let mut reader = FrameReader::new(BufReader::new(&mut peer));
    let frame = reader.next_frame().await.unwrap().unwrap();
    match frame {
        Frame::Response(resp) => {
            assert_eq!(resp.id, RpcId::Number(7));
            assert_eq!(resp.result.unwrap()["id"], json!("child-1"));
        }
        Frame::Request(_) => panic!("expected a response"),
    }
}

#[tokio::test]
async fn call_times_out_and_frees_the_pending_slot_when_the_peer_never_answers() {
    let (transport, _inbound, _peer) = connected_pair().await;
    let err = transport
        .call_with_timeout(method::HEALTH, json!({}), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
}

#[tokio::test]
async fn pending_calls_fail_once_the_peer_disconnects() {
    let (transport, _inbound, peer) = connected_pair().await;
    let call = tokio::spawn({
        let transport = transport.clone();
        async move { transport.call(method::HEALTH, json!({})).await }
    });

    drop(peer);
    let result = call.await.unwrap();
    assert!(result.is_err());
}

#[tokio::test]
async fn closed_resolves_after_the_peer_disconnects() {
    let (transport, _inbound, peer) = connected_pair().await;
    drop(peer);
    tokio::time::timeout(Duration::from_secs(2), transport.closed())
        .await
        .expect("closed() should resolve once the peer hangs up");
}
