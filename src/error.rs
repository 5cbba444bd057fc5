//! Error types for seamrpc.

use thiserror::Error;

/// Main error type for all seamrpc operations.
#[derive(Debug, Error)]
pub enum RpcError {
    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Handshake rejected: bad magic number, unknown codec tag, or a
    /// malformed negotiation record. Fatal to the connection.
    #[error("negotiation error: {0}")]
    Negotiation(String),

    /// Frame-level failure after negotiation (oversize frame, poisoned
    /// writer). Fatal to the connection.
    #[error("framing error: {0}")]
    Frame(String),

    /// JSON encode/decode error (handshake record or JSON payload codec).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack serialization error.
    #[error("MessagePack encode error: {0}")]
    MsgpackEncode(#[from] rmp_serde::encode::Error),

    /// MessagePack deserialization error.
    #[error("MessagePack decode error: {0}")]
    MsgpackDecode(#[from] rmp_serde::decode::Error),

    /// Error reported by the remote method, carried in the response header.
    /// Does not affect connection liveness.
    #[error("remote error: {0}")]
    Application(String),

    /// The client is closing or already shut down.
    #[error("connection is shut down")]
    Shutdown,

    /// The connection failed while calls were outstanding; every pending
    /// call is completed with this error exactly once.
    #[error("connection lost: {0}")]
    Disconnected(String),

    /// No handler registered under the requested `"Service.Method"` name.
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// Per-call deadline elapsed before a reply arrived.
    #[error("call timed out")]
    Timeout,
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;
