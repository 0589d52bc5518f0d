//! Error types for the warren engine

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while supervising tunnels
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or malformed configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Unknown tunnel tag or similar lookup failure
    #[error("{0}")]
    NotFound(String),

    /// Tunnel already running, port taken, duplicate tag
    #[error("{0}")]
    Conflict(String),

    /// Required binary missing, no SSH auth, invalid transport/backend pair
    #[error("{0}")]
    Precondition(String),

    /// DNS exchange or SSH handshake failure
    #[error("upstream failure: {0}")]
    Upstream(String),

    /// Dial timeout, transport not yet ready
    #[error("{0}")]
    Transient(String),

    /// IPC transport or protocol failure
    #[error("ipc error: {0}")]
    Ipc(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode failure
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// DNS subsystem error
    #[error(transparent)]
    Dns(#[from] warren_dns::Error),

    /// SSH session error
    #[error("ssh error: {0}")]
    Ssh(#[from] ssh2::Error),
}
