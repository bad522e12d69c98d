//! Host unix-domain HTTP API.
//!
//! A thin translation layer over [`LifecycleManager`]: no policy lives
//! here, only request parsing, routing, and response formatting. Hand-rolls
//! HTTP/1.1 request-line/header/body parsing rather than pulling in a web
//! framework, since this surface's own policy decisions belong entirely to
//! the CLIs/MCP clients that drive it — it exists here only so the
//! Lifecycle Manager has something to drive end-to-end in tests.
//!
//! The socket is created with file mode `0600`: only the owning user may
//! connect, since there is no other authentication on this surface.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

use aegis_protocol::TetherChannel;

use crate::error::Error;
use crate::instance::InstanceSpec;
use crate::lifecycle::LifecycleManager;

/// Serve the host API on a unix-domain socket at `path` until the process
/// is killed. Removes a stale socket file left over from an unclean
/// shutdown before binding.
pub async fn serve(path: &Path, manager: Arc<LifecycleManager>) -> std::io::Result<()> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    tracing::info!(path = %path.display(), "host API listening");

    loop {
        let (stream, _addr) = listener.accept().await?;
        let manager = manager.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, manager).await {
                tracing::debug!(error = %e, "host API connection error");
            }
        });
    }
}

async fn handle_connection(
    mut stream: UnixStream,
    manager: Arc<LifecycleManager>,
) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(8192);
    let mut chunk = [0u8; 8192];
    let (head_len, content_length) = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(idx) = find_header_end(&buf) {
            let head = String::from_utf8_lossy(&buf[..idx]);
            let content_length = head
                .lines()
                .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().to_string()))
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(0);
            break (idx + 4, content_length);
        }
        if buf.len() > 1 << 20 {
            write_response(&mut stream, "400 Bad Request", &error_body("header too large")).await?;
            return Ok(());
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
    let method = parts.next().unwrap_or("").to_string();
    let raw_path = parts.next().unwrap_or("").to_string();
    let (path, query) = raw_path
        .split_once('?')
        .map(|(p, q)| (p.to_string(), Some(q.to_string())))
        .unwrap_or((raw_path, None));

    route(&mut stream, &method, &path, query.as_deref(), &body, manager).await
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

async fn write_response(stream: &mut UnixStream, status: &str, body: &str) -> std::io::Result<()> {
    let resp = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(resp.as_bytes()).await
}

async fn write_ndjson_preamble(stream: &mut UnixStream) -> std::io::Result<()> {
    let head = "HTTP/1.1 200 OK\r\nContent-Type: application/x-ndjson\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n";
    stream.write_all(head.as_bytes()).await
}

async fn write_ndjson_chunk(stream: &mut UnixStream, value: &Value) -> std::io::Result<()> {
    let mut line = serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string());
    line.push('\n');
    let chunk = format!("{:x}\r\n{line}\r\n", line.len());
    stream.write_all(chunk.as_bytes()).await
}

async fn write_ndjson_end(stream: &mut UnixStream) -> std::io::Result<()> {
    stream.write_all(b"0\r\n\r\n").await
}

fn error_body(message: impl Into<String>) -> String {
    json!({"error": {"message": message.into()}}).to_string()
}

fn err_status_and_body(e: &Error) -> (String, String) {
    let body = json!({"error": {"kind": e.kind(), "message": e.to_string()}}).to_string();
    (format!("{} {}", e.http_status(), status_text(e.http_status())), body)
}

fn status_text(code: u16) -> &'static str {
    match code {
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        409 => "Conflict",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        504 => "Gateway Timeout",
        _ => "Error",
    }
}

fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    query?.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then(|| urlencoding_decode(v))
    })
}

/// Minimal `%XX` decoder: good enough for the small alphanumeric-plus-colon
/// query values this API actually sees (session ids, RFC3339 timestamps).
fn urlencoding_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[derive(Serialize)]
struct InstanceCreated {
    id: String,
}

async fn route(
    stream: &mut UnixStream,
    method: &str,
    path: &str,
    query: Option<&str>,
    body: &[u8],
    manager: Arc<LifecycleManager>,
) -> std::io::Result<()> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    match (method, segments.as_slice()) {
        ("POST", ["v1", "instances"]) => {
            let spec: InstanceSpec = match serde_json::from_slice(body) {
                Ok(s) => s,
                Err(e) => return write_response(stream, "400 Bad Request", &error_body(format!("invalid JSON: {e}"))).await,
            };
            match manager.create(spec).await {
                Ok(id) => {
                    write_response(
                        stream,
                        "201 Created",
                        &serde_json::to_string(&InstanceCreated { id }).unwrap(),
                    )
                    .await
                }
                Err(e) => {
                    let (status, body) = err_status_and_body(&e);
                    write_response(stream, &status, &body).await
                }
            }
        }
        ("GET", ["v1", "instances"]) => {
            let instances = manager.list().await;
            write_response(stream, "200 OK", &serde_json::to_string(&json!({"instances": instances})).unwrap()).await
        }
        ("GET", ["v1", "instances", id]) => match manager.get(id).await {
            Ok(instance) => write_response(stream, "200 OK", &serde_json::to_string(&instance).unwrap()).await,
            Err(e) => {
                let (status, body) = err_status_and_body(&e);
                write_response(stream, &status, &body).await
            }
        },
        ("DELETE", ["v1", "instances", id]) => match manager.delete(id).await {
            Ok(()) => write_response(stream, "200 OK", "{}").await,
            Err(e) => {
                let (status, body) = err_status_and_body(&e);
                write_response(stream, &status, &body).await
            }
        },
        ("POST", ["v1", "instances", id, "ensure"]) => match manager.ensure(id).await {
            Ok(()) => write_response(stream, "200 OK", "{}").await,
            Err(e) => {
                let (status, body) = err_status_and_body(&e);
                write_response(stream, &status, &body).await
            }
        },
        ("POST", ["v1", "instances", id, "pause"]) => match manager.pause(id).await {
            Ok(()) => write_response(stream, "200 OK", "{}").await,
            Err(e) => {
                let (status, body) = err_status_and_body(&e);
                write_response(stream, &status, &body).await
            }
        },
        ("POST", ["v1", "instances", id, "stop"]) => match manager.stop(id).await {
            Ok(()) => write_response(stream, "200 OK", "{}").await,
            Err(e) => {
                let (status, body) = err_status_and_body(&e);
                write_response(stream, &status, &body).await
            }
        },
        ("POST", ["v1", "instances", id, "disable"]) => match manager.disable(id).await {
            Ok(()) => write_response(stream, "200 OK", "{}").await,
            Err(e) => {
                let (status, body) = err_status_and_body(&e);
                write_response(stream, &status, &body).await
            }
        },
        ("POST", ["v1", "instances", id, "exec"]) => exec_stream(stream, id, body, manager).await,
        ("GET", ["v1", "instances", id, "logs"]) => logs_stream(stream, id, query, manager).await,
        ("POST", ["v1", "instances", id, "expose"]) => expose(stream, id, body, manager).await,
        ("DELETE", ["v1", "instances", id, "expose", port]) => unexpose(stream, id, port, manager).await,
        ("POST", ["v1", "instances", id, "tether"]) => tether_send(stream, id, body, manager).await,
        ("GET", ["v1", "instances", id, "tether", "poll"]) => tether_poll(stream, id, query, manager).await,
        ("GET", ["v1", "health"]) => write_response(stream, "200 OK", r#"{"status":"ok"}"#).await,
        _ => write_response(stream, "404 Not Found", &error_body("route not found")).await,
    }
}

#[derive(serde::Deserialize)]
struct ExecRequest {
    command: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
}

async fn exec_stream(
    stream: &mut UnixStream,
    id: &str,
    body: &[u8],
    manager: Arc<LifecycleManager>,
) -> std::io::Result<()> {
    let req: ExecRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => return write_response(stream, "400 Bad Request", &error_body(format!("invalid JSON: {e}"))).await,
    };

    let handle = match manager.exec(id, req.command, req.env).await {
        Ok(h) => h,
        Err(e) => {
            let (status, body) = err_status_and_body(&e);
            return write_response(stream, &status, &body).await;
        }
    };

    write_ndjson_preamble(stream).await?;
    write_ndjson_chunk(
        stream,
        &json!({"exec_id": handle.exec_id, "started_at": handle.started_at_ms}),
    )
    .await?;

    let mut sub = manager.logs().subscribe(id);
    let exec_id = handle.exec_id.clone();
    let mut done_rx = handle.done_rx;

    for entry in sub.snapshot.drain(..).filter(|e| e.exec_id.as_deref() == Some(exec_id.as_str())) {
        write_ndjson_chunk(stream, &serde_json::to_value(&entry).unwrap()).await?;
    }

    loop {
        tokio::select! {
            biased;
            exit_code = &mut done_rx => {
                let exit_code = exit_code.unwrap_or(-1);
                write_ndjson_chunk(stream, &json!({"done": true, "exit_code": exit_code})).await?;
                break;
            }
            entry = sub.rx.recv() => {
                match entry {
                    Ok(entry) if entry.exec_id.as_deref() == Some(exec_id.as_str()) => {
                        write_ndjson_chunk(stream, &serde_json::to_value(&entry).unwrap()).await?;
                    }
                    Ok(_) => continue,
                    Err(_) => continue,
                }
            }
        }
    }
    write_ndjson_end(stream).await
}

async fn logs_stream(
    stream: &mut UnixStream,
    id: &str,
    query: Option<&str>,
    manager: Arc<LifecycleManager>,
) -> std::io::Result<()> {
    if manager.get(id).await.is_err() {
        return write_response(stream, "404 Not Found", &error_body(format!("instance {id}"))).await;
    }

    let follow = query_param(query, "follow").as_deref() == Some("1");
    let tail: Option<usize> = query_param(query, "tail").and_then(|v| v.parse().ok());
    let exec_id = query_param(query, "exec_id");
    let since_ms: Option<u64> = query_param(query, "since").and_then(|s| parse_rfc3339_ms(&s));

    let mut sub = manager.logs().subscribe(id);
    let mut snapshot: Vec<_> = sub
        .snapshot
        .drain(..)
        .filter(|e| exec_id.as_deref().map(|eid| e.exec_id.as_deref() == Some(eid)).unwrap_or(true))
        .filter(|e| since_ms.map(|t| e.ts > t).unwrap_or(true))
        .collect();
    if let Some(n) = tail {
        if snapshot.len() > n {
            let drop = snapshot.len() - n;
            snapshot.drain(0..drop);
        }
    }

    write_ndjson_preamble(stream).await?;
    for entry in snapshot {
        write_ndjson_chunk(stream, &serde_json::to_value(&entry).unwrap()).await?;
    }

    if follow {
        while let Ok(entry) = sub.rx.recv().await {
            if exec_id.as_deref().map(|eid| entry.exec_id.as_deref() == Some(eid)).unwrap_or(true) {
                write_ndjson_chunk(stream, &serde_json::to_value(&entry).unwrap()).await?;
            }
        }
    }
    write_ndjson_end(stream).await
}

/// Parses a subset of RFC3339 (`YYYY-MM-DDTHH:MM:SSZ`) into epoch millis
/// without pulling in a datetime crate, since the only thing the `/logs`
/// endpoint needs is a comparable timestamp.
fn parse_rfc3339_ms(s: &str) -> Option<u64> {
    let s = s.trim_end_matches('Z');
    let (date, time) = s.split_once('T')?;
    let mut d = date.split('-');
    let year: i64 = d.next()?.parse().ok()?;
    let month: i64 = d.next()?.parse().ok()?;
    let day: i64 = d.next()?.parse().ok()?;
    let mut t = time.split(':');
    let hour: i64 = t.next()?.parse().ok()?;
    let minute: i64 = t.next()?.parse().ok()?;
    let second: f64 = t.next()?.parse().ok()?;

    let days_from_epoch = days_from_civil(year, month, day);
    let secs = days_from_epoch * 86400 + hour * 3600 + minute * 60 + second as i64;
    Some((secs.max(0) as u64) * 1000)
}

fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as i64;
    let mp = (m + 9) % 12;
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146097 + doe - 719468
}

#[derive(serde::Deserialize)]
struct ExposeRequest {
    guest_port: u16,
}

async fn expose(
    stream: &mut UnixStream,
    id: &str,
    body: &[u8],
    manager: Arc<LifecycleManager>,
) -> std::io::Result<()> {
    let req: ExposeRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => return write_response(stream, "400 Bad Request", &error_body(format!("invalid JSON: {e}"))).await,
    };
    match manager.ensure(id).await {
        Ok(()) => {}
        Err(e) => {
            let (status, body) = err_status_and_body(&e);
            return write_response(stream, &status, &body).await;
        }
    }
    match manager.get(id).await {
        Ok(instance) => {
            if let Some(host_port) = instance.endpoints.get(&req.guest_port) {
                write_response(
                    stream,
                    "200 OK",
                    &json!({"guest_port": req.guest_port, "host_port": host_port}).to_string(),
                )
                .await
            } else {
                write_response(
                    stream,
                    "404 Not Found",
                    &error_body("port not exposed for this instance"),
                )
                .await
            }
        }
        Err(e) => {
            let (status, body) = err_status_and_body(&e);
            write_response(stream, &status, &body).await
        }
    }
}

async fn unexpose(
    stream: &mut UnixStream,
    id: &str,
    port: &str,
    manager: Arc<LifecycleManager>,
) -> std::io::Result<()> {
    let Ok(guest_port) = port.parse::<u16>() else {
        return write_response(stream, "400 Bad Request", &error_body("invalid port")).await;
    };
    match manager.unexpose(id, guest_port).await {
        Ok(()) => write_response(stream, "200 OK", "{}").await,
        Err(e) => {
            let (status, body) = err_status_and_body(&e);
            write_response(stream, &status, &body).await
        }
    }
}

#[derive(serde::Deserialize)]
struct TetherSendRequest {
    #[serde(default = "default_frame_type")]
    #[serde(rename = "type")]
    frame_type: String,
    session: TetherSessionRequest,
    #[serde(default)]
    msg_id: Option<String>,
    #[serde(default)]
    payload: Value,
}

fn default_frame_type() -> String {
    "message".to_string()
}

#[derive(serde::Deserialize)]
struct TetherSessionRequest {
    id: String,
}

async fn tether_send(
    stream: &mut UnixStream,
    id: &str,
    body: &[u8],
    manager: Arc<LifecycleManager>,
) -> std::io::Result<()> {
    let req: TetherSendRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => return write_response(stream, "400 Bad Request", &error_body(format!("invalid JSON: {e}"))).await,
    };
    match manager
        .send_tether(id, &req.session.id, req.frame_type, req.msg_id, req.payload)
        .await
    {
        Ok(seq) => write_response(stream, "200 OK", &json!({"ingress_seq": seq}).to_string()).await,
        Err(e) => {
            let (status, body) = err_status_and_body(&e);
            write_response(stream, &status, &body).await
        }
    }
}

async fn tether_poll(
    stream: &mut UnixStream,
    id: &str,
    query: Option<&str>,
    manager: Arc<LifecycleManager>,
) -> std::io::Result<()> {
    if manager.get(id).await.is_err() {
        return write_response(stream, "404 Not Found", &error_body(format!("instance {id}"))).await;
    }
    let channel = match query_param(query, "channel").as_deref() {
        Some("guest") => TetherChannel::Guest,
        _ => TetherChannel::Host,
    };
    let session_id = query_param(query, "session_id").unwrap_or_default();
    let after_seq: u64 = query_param(query, "after_seq").and_then(|v| v.parse().ok()).unwrap_or(0);
    let limit: usize = query_param(query, "limit").and_then(|v| v.parse().ok()).unwrap_or(100);
    let wait_ms: u64 = query_param(query, "wait_ms").and_then(|v| v.parse().ok()).unwrap_or(0);
    let wait_ms = wait_ms.min(Duration::from_secs(30).as_millis() as u64);

    let result = manager.poll_tether(id, channel, &session_id, after_seq, limit, wait_ms).await;
    let frames: Vec<Value> = result
        .frames
        .iter()
        .map(|f| {
            json!({
                "seq": f.seq,
                "type": f.frame_type,
                "ts_ms": f.ts_ms,
                "msg_id": f.msg_id,
                "payload": f.payload,
            })
        })
        .collect();
    write_response(
        stream,
        "200 OK",
        &json!({"frames": frames, "next_seq": result.next_seq, "timed_out": result.timed_out}).to_string(),
    )
    .await
}
