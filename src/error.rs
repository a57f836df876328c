//! Error types for greetwire.

use thiserror::Error;

/// Main error type for all greetwire operations.
#[derive(Debug, Error)]
pub enum GreetError {
    /// I/O error on the underlying byte stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error (control line and config files).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Protocol error (invalid frame, wrong flags, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration value.
    #[error("Config error: {0}")]
    Config(String),

    /// The channel could not be established.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The caller-imposed deadline elapsed.
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// Send or receive failed mid-stream.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation attempted on a session (or direction) that is already closed.
    #[error("Session closed")]
    SessionClosed,

    /// The remote handler failed and reported an error status.
    #[error("Remote status: {0}")]
    Status(String),

    /// No handler is registered for the given method ID.
    #[error("Unknown method ID: {0}")]
    UnknownMethod(u16),
}

impl GreetError {
    /// Whether this error came from the transport rather than from the
    /// session's own lifecycle or the remote handler.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            GreetError::Io(_)
                | GreetError::Connection(_)
                | GreetError::Transport(_)
                | GreetError::DeadlineExceeded
        )
    }
}

/// Result type alias using GreetError.
pub type Result<T> = std::result::Result<T, GreetError>;
