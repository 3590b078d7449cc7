//! Core control-plane errors

use thiserror::Error;

/// Core control-plane errors
#[derive(Debug, Error)]
pub enum CoreError {
    /// Node, tunnel, forward, share or reservation missing
    #[error("{0} not found")]
    NotFound(String),

    /// No free port left on a local node
    #[error("Port exhausted on node {node_id}")]
    PortExhausted { node_id: i64 },

    /// No free port left in a peer share
    #[error("Capacity exhausted: {0}")]
    CapacityExhausted(String),

    /// Bad or unknown credential
    #[error("Unauthorized")]
    Unauthorized,

    /// Credential valid but the grant does not allow the call
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Remote side could not be reached
    #[error("Remote unreachable: {0}")]
    RemoteUnreachable(String),

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,

    /// Undecodable control message
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Caller supplied invalid data
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// State changed underneath a planned operation
    #[error("Conflict: {0}")]
    Conflict(String),

    /// JSON column could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Storage error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl CoreError {
    /// Shorthand for a missing entity
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::NotFound(what.to_string())
    }
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;
