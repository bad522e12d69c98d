//! Shared wire-format types for Aegis host <-> guest-harness communication.
//!
//! This crate is the single source of truth for the control protocol spoken
//! between the host (`aegis`) and the guest PID-1 harness (`aegis-harness`).
//! Both crates depend on this to avoid struct duplication across the trust
//! boundary.
//!
//! ## Wire format
//!
//! Newline-delimited JSON-RPC 2.0. Every line on the wire is exactly one
//! UTF-8 JSON object, terminated by `\n`, capped at [`MAX_FRAME_BYTES`].
//! Requests carry a non-null `id`; notifications omit it; responses echo
//! the request's `id`. The channel is full-duplex: either side may send
//! requests, responses, or notifications at any time, interleaved on the
//! same connection.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

mod codec;
pub use codec::{FrameReader, FrameWriter};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors that can occur while framing or parsing protocol messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame exceeded {MAX_FRAME_BYTES} byte cap")]
    FrameTooLarge,
    #[error("connection closed")]
    Closed,
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Maximum size of a single framed line, including the trailing newline.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

// ---------------------------------------------------------------------------
// JSON-RPC envelope
// ---------------------------------------------------------------------------

/// Standard JSON-RPC error codes, plus the two Aegis-specific extensions
/// named in the control-protocol contract (`-32000` execution errors,
/// `-32601` unknown method).
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    /// Execution errors raised by a handler (guest process failed to start,
    /// capability denied, instance not found, ...).
    pub const EXECUTION_ERROR: i64 = -32000;
}

/// A JSON-RPC request id: either a string or a number, never both.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    Number(i64),
    String(String),
}

impl fmt::Display for RpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcId::Number(n) => write!(f, "{n}"),
            RpcId::String(s) => write!(f, "{s}"),
        }
    }
}

/// An outbound or inbound JSON-RPC request/notification.
///
/// A `None` id marks a notification (fire-and-forget, no response expected).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RpcId>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl RpcRequest {
    pub fn request(id: RpcId, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id: None,
            method: method.into(),
            params,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// A JSON-RPC response, correlated to its request by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    pub id: RpcId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn ok(id: RpcId, result: Value) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: RpcId, error: RpcError) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            error_codes::METHOD_NOT_FOUND,
            format!("unknown method: {method}"),
        )
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(error_codes::EXECUTION_ERROR, message)
    }
}

fn jsonrpc_version() -> String {
    "2.0".to_string()
}

/// A decoded line: either a request/notification or a response. The reader
/// side dispatches on this to route inbound traffic, since both directions
/// share one connection.
#[derive(Debug, Clone)]
pub enum Frame {
    Request(RpcRequest),
    Response(RpcResponse),
}

impl Frame {
    /// Decode one newline-delimited JSON object. Distinguishes requests
    /// from responses by the presence of the `method` field, which is
    /// exclusive to requests/notifications in this protocol.
    pub fn decode(line: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(line).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        if value.get("method").is_some() {
            let req: RpcRequest = serde_json::from_value(value)?;
            Ok(Frame::Request(req))
        } else {
            let resp: RpcResponse = serde_json::from_value(value)?;
            Ok(Frame::Response(resp))
        }
    }

    pub fn encode(&self) -> Result<String> {
        let s = match self {
            Frame::Request(r) => serde_json::to_string(r)?,
            Frame::Response(r) => serde_json::to_string(r)?,
        };
        Ok(s)
    }
}

// ---------------------------------------------------------------------------
// Method names
// ---------------------------------------------------------------------------

/// RPC method names, grouped by who issues the request.
pub mod method {
    // Host -> guest requests.
    pub const RUN: &str = "run";
    pub const EXEC: &str = "exec";
    pub const HEALTH: &str = "health";
    pub const SHUTDOWN: &str = "shutdown";

    // Guest -> host requests, issued on behalf of the in-guest user program
    // via the Guest API.
    pub const GUEST_SPAWN: &str = "guest.spawn";
    pub const GUEST_LIST_CHILDREN: &str = "guest.list_children";
    pub const GUEST_STOP_CHILD: &str = "guest.stop_child";
    pub const GUEST_SELF_INFO: &str = "guest.self_info";
    pub const GUEST_EXPOSE_PORT: &str = "guest.expose_port";
    pub const GUEST_UNEXPOSE_PORT: &str = "guest.unexpose_port";

    // Notifications (either direction, no response expected).
    pub const LOG: &str = "log";
    pub const PROCESS_EXITED: &str = "processExited";
    pub const EXEC_DONE: &str = "execDone";
    pub const SERVER_READY: &str = "serverReady";
    pub const ACTIVITY: &str = "activity";
    pub const KEEPALIVE: &str = "keepalive";
    pub const KEEPALIVE_RELEASE: &str = "keepalive.release";
    pub const TETHER_FRAME: &str = "tether.frame";
}

// ---------------------------------------------------------------------------
// Payload types: host -> guest
// ---------------------------------------------------------------------------

/// Params for the `run` request: start the primary process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunParams {
    pub command: Vec<String>,
    #[serde(default)]
    pub env: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub expose_ports: Vec<u16>,
}

/// Result of a successful `run` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub pid: u32,
}

/// Params for the `exec` request: run a transient, tagged child process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecParams {
    pub exec_id: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub env: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub workdir: Option<String>,
}

/// Result of an `exec` request: acknowledgement that the process started.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResult {
    pub exec_id: String,
    pub started_at_ms: u64,
}

/// Result of a `health` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResult {
    pub primary_running: bool,
    pub uptime_secs: u64,
}

// ---------------------------------------------------------------------------
// Payload types: guest -> host
// ---------------------------------------------------------------------------

/// Params for `guest.spawn`: ask the host to create and ensure a child
/// instance on this instance's behalf.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestSpawnParams {
    pub command: Vec<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub env: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub memory_mb: Option<u32>,
    #[serde(default)]
    pub vcpus: Option<u32>,
    #[serde(default)]
    pub expose_ports: Vec<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestSpawnResult {
    pub id: String,
    pub spawn_depth: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestChildDescriptor {
    pub id: String,
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestListChildrenResult {
    pub children: Vec<GuestChildDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestStopChildParams {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestSelfInfoResult {
    pub id: String,
    pub state: String,
    pub spawn_depth: u32,
    pub endpoints: std::collections::HashMap<u16, u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestExposePortParams {
    pub guest_port: u16,
    #[serde(default)]
    pub protocol: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestExposePortResult {
    pub guest_port: u16,
    pub host_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestUnexposePortParams {
    pub guest_port: u16,
}

// ---------------------------------------------------------------------------
// Notification payloads
// ---------------------------------------------------------------------------

/// `log` notification: one line of stdout/stderr from the primary or an
/// exec process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogNotification {
    pub stream: LogStream,
    pub line: String,
    #[serde(default)]
    pub exec_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// `processExited` notification: the primary process exited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessExitedNotification {
    pub exit_code: i32,
}

/// `execDone` notification: a tagged exec process finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecDoneNotification {
    pub exec_id: String,
    pub exit_code: i32,
}

/// `activity` notification: periodic delta-encoded activity sample.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActivityNotification {
    pub conns: u32,
    pub cpu_ticks: u64,
    pub tx_bytes_delta: u64,
    pub rx_bytes_delta: u64,
}

/// `keepalive` notification: assert an active-use lease from inside the VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepaliveNotification {
    pub reason: String,
    pub ttl_secs: u64,
}

/// `keepalive.release` notification: release a previously-asserted lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepaliveReleaseNotification {
    pub reason: String,
}

/// A tether session identifier: a channel (`host` or `guest`) plus an
/// opaque per-conversation session id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TetherSession {
    pub channel: TetherChannel,
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TetherChannel {
    Host,
    Guest,
}

/// `tether.frame` notification. The payload is opaque except for the
/// top-level `session` and `type` fields, which the bus uses for routing;
/// everything else is application data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TetherFrameNotification {
    pub session: TetherSession,
    pub seq: u64,
    #[serde(rename = "type")]
    pub frame_type: String,
    pub ts_ms: u64,
    #[serde(default)]
    pub msg_id: Option<String>,
    pub payload: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_round_trip() {
        let req = RpcRequest::request(RpcId::Number(1), method::RUN, json!({"command": ["echo"]}));
        let encoded = serde_json::to_string(&req).unwrap();
        assert!(encoded.contains("\"method\":\"run\""));
        let decoded: RpcRequest = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.method, method::RUN);
        assert_eq!(decoded.id, Some(RpcId::Number(1)));
    }

    #[test]
    fn notification_has_no_id() {
        let note = RpcRequest::notification(method::LOG, json!({"line": "hi"}));
        let encoded = serde_json::to_string(&note).unwrap();
        assert!(!encoded.contains("\"id\""));
        assert!(note.is_notification());
    }

    #[test]
    fn frame_decode_distinguishes_request_from_response() {
        let req_line = r#"{"jsonrpc":"2.0","id":1,"method":"health","params":{}}"#;
        match Frame::decode(req_line).unwrap() {
            Frame::Request(r) => assert_eq!(r.method, "health"),
            Frame::Response(_) => panic!("expected request"),
        }

        let resp_line = r#"{"jsonrpc":"2.0","id":1,"result":{"primary_running":true,"uptime_secs":5}}"#;
        match Frame::decode(resp_line).unwrap() {
            Frame::Response(r) => assert_eq!(r.id, RpcId::Number(1)),
            Frame::Request(_) => panic!("expected response"),
        }
    }

    #[test]
    fn rpc_error_method_not_found_uses_standard_code() {
        let e = RpcError::method_not_found("bogus");
        assert_eq!(e.code, error_codes::METHOD_NOT_FOUND);
    }

    #[test]
    fn rpc_id_string_variant_round_trips() {
        let id = RpcId::String("exec-42".to_string());
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"exec-42\"");
        let back: RpcId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn tether_frame_round_trip() {
        let frame = TetherFrameNotification {
            session: TetherSession {
                channel: TetherChannel::Guest,
                id: "sess-1".into(),
            },
            seq: 7,
            frame_type: "agent.message".into(),
            ts_ms: 1_700_000_000_000,
            msg_id: Some("m1".into()),
            payload: json!({"text": "hello"}),
        };
        let json = serde_json::to_string(&frame).unwrap();
        let decoded: TetherFrameNotification = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.seq, 7);
        assert_eq!(decoded.session.id, "sess-1");
    }
}
