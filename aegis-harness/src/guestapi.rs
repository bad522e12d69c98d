//! Guest API: an HTTP server on the fixed loopback port `127.0.0.1:7777`
//! that the user program talks to. Authorization is implicit — reaching
//! the port at all *is* the capability, since only code running inside
//! this VM can dial loopback.
//!
//! Hand-rolls HTTP/1.1 parsing in the host daemon's style rather than
//! pulling in a web framework, matching the minimal footprint the rest of
//! this image aims for.

use std::net::SocketAddr;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use aegis_protocol::method;

use crate::connection::Connection;
use crate::klog::log;

pub const GUEST_API_ADDR: SocketAddr = SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1)), 7777);

pub async fn serve(conn: Connection) {
    let listener = match TcpListener::bind(GUEST_API_ADDR).await {
        Ok(l) => l,
        Err(e) => {
            log(&format!("guest API failed to bind {GUEST_API_ADDR}: {e}"));
            return;
        }
    };
    log(&format!("guest API listening on {GUEST_API_ADDR}"));

    loop {
        let (stream, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(_) => continue,
        };
        let conn = conn.clone();
        tokio::spawn(async move {
            let _ = handle_connection(stream, conn).await;
        });
    }
}

async fn handle_connection(mut stream: TcpStream, conn: Connection) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    let (head_len, content_length) = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(idx) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..idx]);
            let content_length = head
                .lines()
                .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().to_string()))
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(0);
            break (idx + 4, content_length);
        }
        if buf.len() > 1 << 20 {
            return write_response(&mut stream, "400 Bad Request", &error_body("header too large")).await;
        }
    };

    while buf.len() < head_len + content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let head = String::from_utf8_lossy(&buf[..head_len.min(buf.len())]).to_string();
    let body = buf[head_len.min(buf.len())..].to_vec();

    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or("");
    let mut parts = request_line.split_whitespace();
    let http_method = parts.next().unwrap_or("").to_string();
    let path = parts.next().unwrap_or("").to_string();

    route(&mut stream, &http_method, &path, &body, conn).await
}

async fn write_response(stream: &mut TcpStream, status: &str, body: &str) -> std::io::Result<()> {
    let resp = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(resp.as_bytes()).await
}

fn error_body(message: impl Into<String>) -> String {
    json!({"error": {"message": message.into()}}).to_string()
}

async fn route(
    stream: &mut TcpStream,
    http_method: &str,
    path: &str,
    body: &[u8],
    conn: Connection,
) -> std::io::Result<()> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    match (http_method, segments.as_slice()) {
        ("POST", ["v1", "instances"]) => {
            let params: Value = match serde_json::from_slice(body) {
                Ok(v) => v,
                Err(e) => return write_response(stream, "400 Bad Request", &error_body(e.to_string())).await,
            };
            forward(stream, &conn, method::GUEST_SPAWN, params).await
        }
        ("GET", ["v1", "instances"]) => forward(stream, &conn, method::GUEST_LIST_CHILDREN, json!({})).await,
        ("POST", ["v1", "instances", id, "stop"]) => {
            forward(stream, &conn, method::GUEST_STOP_CHILD, json!({"id": id})).await
        }
        ("GET", ["v1", "self"]) => forward(stream, &conn, method::GUEST_SELF_INFO, json!({})).await,
        ("POST", ["v1", "self", "keepalive"]) => {
            let req: KeepaliveRequest = serde_json::from_slice(body).unwrap_or_default();
            conn.notify(
                method::KEEPALIVE,
                json!({"reason": req.reason, "ttl_secs": req.ttl_secs.unwrap_or(30)}),
            );
            write_response(stream, "200 OK", "{}").await
        }
        ("DELETE", ["v1", "self", "keepalive"]) => {
            conn.notify(method::KEEPALIVE_RELEASE, json!({"reason": "released"}));
            write_response(stream, "200 OK", "{}").await
        }
        ("POST", ["v1", "self", "restart"]) => {
            if conn.request_self_restart().await {
                conn.terminate_primary().await;
                write_response(stream, "200 OK", "{}").await
            } else {
                write_response(stream, "409 Conflict", &error_body("no primary process running")).await
            }
        }
        ("POST", ["v1", "self", "expose"]) => {
            let params: Value = match serde_json::from_slice(body) {
                Ok(v) => v,
                Err(e) => return write_response(stream, "400 Bad Request", &error_body(e.to_string())).await,
            };
            let guest_port = params.get("guest_port").and_then(Value::as_u64).map(|p| p as u16);
            let result = forward(stream, &conn, method::GUEST_EXPOSE_PORT, params).await;
            if let Some(port) = guest_port {
                if let Some(ip) = crate::env::lookup("AEGIS_NET_IP").and_then(|cidr| {
                    cidr.split('/').next().and_then(|a| a.parse().ok())
                }) {
                    crate::portproxy::start_all(ip, &[port]);
                }
            }
            result
        }
        ("DELETE", ["v1", "self", "expose", port]) => {
            let Ok(guest_port) = port.parse::<u16>() else {
                return write_response(stream, "400 Bad Request", &error_body("invalid port")).await;
            };
            forward(stream, &conn, method::GUEST_UNEXPOSE_PORT, json!({"guest_port": guest_port})).await
        }
        ("POST", ["v1", "tether", "send"]) => {
            let req: TetherSendRequest = match serde_json::from_slice(body) {
                Ok(r) => r,
                Err(e) => return write_response(stream, "400 Bad Request", &error_body(e.to_string())).await,
            };
            conn.notify(
                method::TETHER_FRAME,
                json!({
                    "session": {"channel": "guest", "id": req.session_id},
                    "seq": 0,
                    "type": req.frame_type,
                    "ts_ms": crate::now_ms(),
                    "msg_id": req.msg_id,
                    "payload": req.payload,
                }),
            );
            write_response(stream, "200 OK", "{}").await
        }
        _ => write_response(stream, "404 Not Found", &error_body("route not found")).await,
    }
}

async fn forward(stream: &mut TcpStream, conn: &Connection, rpc_method: &str, params: Value) -> std::io::Result<()> {
    match conn.call(rpc_method, params).await {
        Ok(result) => write_response(stream, "200 OK", &serde_json::to_string(&result).unwrap_or_else(|_| "{}".into())).await,
        Err(e) => write_response(stream, "500 Internal Server Error", &error_body(e.message)).await,
    }
}

#[derive(Default, serde::Deserialize)]
struct KeepaliveRequest {
    #[serde(default)]
    reason: String,
    #[serde(default)]
    ttl_secs: Option<u64>,
}

#[derive(serde::Deserialize)]
struct TetherSendRequest {
    session_id: String,
    #[serde(rename = "type", default = "default_frame_type")]
    frame_type: String,
    #[serde(default)]
    msg_id: Option<String>,
    #[serde(default)]
    payload: Value,
}

fn default_frame_type() -> String {
    "message".to_string()
}
