//! # Error Taxonomy
//!
//! Purpose: One error type for every layer of the client, so a failure keeps
//! its kind from the socket up to the caller.
//!
//! ## Design Principles
//! 1. **Kind Preservation**: Retries surface the original error, never a
//!    generic "retries exhausted" wrapper.
//! 2. **Explicit Classification**: `is_transient()` is the single place that
//!    decides what the retry policy may re-issue.
//! 3. **Not-Found Is Data**: A missing key is a result value, so there is no
//!    `NotFound` variant here.

use std::io;

use thiserror::Error;

/// Result alias used across the MemCluster crates.
pub type McResult<T> = Result<T, McError>;

/// Errors surfaced by the MemCluster client.
#[derive(Debug, Error)]
pub enum McError {
    /// Socket reset, EOF, refused connect, or any other I/O failure.
    #[error("connection error: {0}")]
    Connection(#[source] io::Error),

    /// No data (or no write progress) within the configured window.
    #[error("operation timed out")]
    Timeout,

    /// Malformed frame or unexpected reply for the issued command.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Server-declared value length exceeds the caller's cap.
    #[error("value of {declared} bytes exceeds limit of {limit} bytes")]
    Oversize { declared: usize, limit: usize },

    /// Explicit error reply from the server.
    ///
    /// `temporary` is set for busy/out-of-memory style replies.
    #[error("server error: {message}")]
    Server { message: String, temporary: bool },

    /// Invalid node list or client options.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Key is empty or contains bytes the text protocol cannot carry.
    #[error("invalid key")]
    InvalidKey,

    /// Key (including prefix) exceeds `MAX_KEY_LENGTH`.
    #[error("key exceeds {} bytes", crate::types::MAX_KEY_LENGTH)]
    KeyTooLong,

    /// Owner node is marked down and the routing policy fails fast.
    #[error("node {0} is marked down")]
    NodeDown(String),

    /// Every configured node is down.
    #[error("no servers available")]
    NoServers,

    /// Node pool is at capacity and no idle connection is available.
    #[error("connection pool exhausted for node {0}")]
    PoolExhausted(String),
}

impl McError {
    /// Returns true when the operation may succeed if issued again.
    pub fn is_transient(&self) -> bool {
        match self {
            McError::Connection(_) | McError::Timeout | McError::NodeDown(_) => true,
            McError::Server { temporary, .. } => *temporary,
            _ => false,
        }
    }

    /// Returns true when the failure says something about node health.
    ///
    /// Busy replies prove the node is alive, so they do not count.
    pub fn is_node_failure(&self) -> bool {
        matches!(self, McError::Connection(_) | McError::Timeout)
    }

    /// Builds a protocol error from anything printable.
    pub fn protocol(message: impl Into<String>) -> Self {
        McError::Protocol(message.into())
    }
}

impl From<io::Error> for McError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            // Socket deadlines surface as WouldBlock on unix and TimedOut on windows.
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => McError::Timeout,
            _ => McError::Connection(err),
        }
    }
}
