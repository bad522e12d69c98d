//! Error taxonomy for the Aegis host daemon.
//!
//! Mirrors the error kinds named in the control-protocol contract: each
//! variant maps to both a JSON-RPC error code (for guest<->host traffic)
//! and an HTTP status (for the unix-domain API), so a single error value
//! can surface correctly at either boundary.

use thiserror::Error;

/// Result type alias using the Aegis [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed request: missing fields, bad JSON, invalid port, etc.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No instance/app/secret with that id or handle.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate handle, primary already running, or op on a stopped
    /// instance that requires it to be live.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A `guest.spawn` request violated the caller's capability policy.
    #[error("capability denied: {0}")]
    CapabilityDenied(String),

    /// The VMM driver rejected a start/pause/resume/stop call.
    #[error("vmm error: {0}")]
    Vmm(String),

    /// Transport dial failure or broken pipe; the instance is marked
    /// `stopped` by the caller after this is raised.
    #[error("transport error: {0}")]
    Transport(String),

    /// Boot, exec, or readiness timeout.
    #[error("timeout: {0}")]
    Timeout(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] aegis_protocol::ProtocolError),
}

impl Error {
    /// JSON-RPC 2.0 error code for this error, per the wire contract.
    pub fn rpc_code(&self) -> i64 {
        use aegis_protocol::error_codes::*;
        match self {
            Error::InvalidRequest(_) => INVALID_PARAMS,
            Error::NotFound(_)
            | Error::Conflict(_)
            | Error::CapabilityDenied(_)
            | Error::Vmm(_)
            | Error::Transport(_)
            | Error::Timeout(_) => EXECUTION_ERROR,
            Error::Io(_) | Error::Json(_) | Error::Protocol(_) => INTERNAL_ERROR,
        }
    }

    /// HTTP status for this error on the unix-domain host API.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::InvalidRequest(_) => 400,
            Error::NotFound(_) => 404,
            Error::Conflict(_) => 409,
            Error::CapabilityDenied(_) => 403,
            Error::Vmm(_) | Error::Io(_) | Error::Json(_) | Error::Protocol(_) => 500,
            Error::Transport(_) => 502,
            Error::Timeout(_) => 504,
        }
    }

    /// Machine-readable error kind, used in HTTP error bodies
    /// (`{"error":{"kind":"...","message":"..."}}`).
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidRequest(_) => "invalid_request",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::CapabilityDenied(_) => "capability_denied",
            Error::Vmm(_) => "vmm",
            Error::Transport(_) => "transport",
            Error::Timeout(_) => "timeout",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Protocol(_) => "protocol",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_404_and_execution_error() {
        let e = Error::NotFound("instance i1".into());
        assert_eq!(e.http_status(), 404);
        assert_eq!(e.rpc_code(), aegis_protocol::error_codes::EXECUTION_ERROR);
    }

    #[test]
    fn capability_denied_maps_to_403() {
        let e = Error::CapabilityDenied("spawn_depth exhausted".into());
        assert_eq!(e.http_status(), 403);
        assert_eq!(e.kind(), "capability_denied");
    }

    #[test]
    fn invalid_request_maps_to_invalid_params() {
        let e = Error::InvalidRequest("missing command".into());
        assert_eq!(e.rpc_code(), aegis_protocol::error_codes::INVALID_PARAMS);
        assert_eq!(e.http_status(), 400);
    }
}
