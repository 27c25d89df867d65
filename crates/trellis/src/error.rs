use std::{io, time::Duration};

use thiserror::Error;

/// Errors surfaced by clients, servers and the smart client.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("client is shut down")]
    Shutdown,
    #[error("no server available")]
    NoServer,
    #[error("selected server is unavailable")]
    ServerUnavailable,
    #[error("failed to connect to `{address}`: {source}")]
    ConnectFailed {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("connection failed: {0}")]
    Io(#[from] io::Error),
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("compression failed: {0}")]
    Compression(String),
    #[error("codec failed: {0}")]
    Codec(String),
    #[error("payload type mismatch: {0}")]
    TypeMismatch(String),
    #[error("service not found: {0}")]
    ServiceNotFound(String),
    #[error("method not found: {0}")]
    MethodNotFound(String),
    #[error("handler failed: {0}")]
    Handler(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Multi(#[from] MultiError),
}

impl RpcError {
    /// Symbolic kind carried on the wire under the `_kind` metadata key.
    pub fn kind(&self) -> &'static str {
        match self {
            RpcError::Shutdown => "shutdown",
            RpcError::NoServer => "no_server",
            RpcError::ServerUnavailable => "server_unavailable",
            RpcError::ConnectFailed { .. } => "connect_failed",
            RpcError::Io(_) => "io",
            RpcError::MalformedFrame(_) => "malformed_frame",
            RpcError::Compression(_) => "compression",
            RpcError::Codec(_) => "codec",
            RpcError::TypeMismatch(_) => "type_mismatch",
            RpcError::ServiceNotFound(_) => "service_not_found",
            RpcError::MethodNotFound(_) => "method_not_found",
            RpcError::Handler(_) => "handler",
            RpcError::Unauthorized(_) => "unauthorized",
            RpcError::Timeout(_) => "timeout",
            RpcError::Multi(_) => "multi",
        }
    }

    /// Rebuilds an error from the `_kind`/`_error` metadata of an
    /// `Error`-status response. Unknown kinds map to [`RpcError::Handler`].
    pub fn from_wire(kind: &str, message: String) -> RpcError {
        match kind {
            "shutdown" => RpcError::Shutdown,
            "codec" => RpcError::Codec(message),
            "type_mismatch" => RpcError::TypeMismatch(message),
            "service_not_found" => RpcError::ServiceNotFound(message),
            "method_not_found" => RpcError::MethodNotFound(message),
            "unauthorized" => RpcError::Unauthorized(message),
            _ => RpcError::Handler(message),
        }
    }
}

/// Aggregate of several call failures, produced by `close` and fan-out calls.
#[derive(Debug, Error)]
#[error("{}", .errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
pub struct MultiError {
    pub errors: Vec<RpcError>,
}

impl MultiError {
    pub fn new(errors: Vec<RpcError>) -> Self {
        Self { errors }
    }
}
