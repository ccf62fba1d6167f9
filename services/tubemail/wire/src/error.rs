//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// A block without even a type tag
    #[error("received empty frame")]
    Empty,

    /// Unknown message type tag
    #[error("unknown frametype: {0}")]
    Type(u8),

    /// Hello frame did not carry the expected magic
    #[error("wrong magic")]
    Magic,

    /// JSON payload could not be parsed or failed validation
    #[error("invalid payload: {0}")]
    Json(#[from] serde_json::Error),

    /// Identity is not exactly 128 lowercase hex characters
    #[error("invalid id: expected 128 lowercase hex characters")]
    InvalidId,

    /// Gossip host is not a literal IP address
    #[error("invalid host: {0}")]
    InvalidHost(String),

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),
}
