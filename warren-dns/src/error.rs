//! Error types for DNS operations

use std::net::SocketAddr;

use thiserror::Error;

/// Result type alias for DNS operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while resolving or serving DNS
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid upstream address or cache configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed DNS message
    #[error("dns message error: {0}")]
    Message(String),

    /// An upstream exchange failed
    #[error("upstream {addr} failed: {reason}")]
    Upstream { addr: SocketAddr, reason: String },

    /// An upstream exchange timed out
    #[error("upstream {0} timed out")]
    Timeout(SocketAddr),

    /// No upstream servers are configured or reachable
    #[error("no upstream DNS servers available")]
    NoUpstreams,
}
