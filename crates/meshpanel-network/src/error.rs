//! Control channel error types

use thiserror::Error;

/// Control channel errors
#[derive(Debug, Error)]
pub enum NetworkError {
    /// No live session for the node
    #[error("Node {0} is offline")]
    NodeOffline(i64),

    /// Session closed while the request was pending
    #[error("Node {0} disconnected")]
    Disconnected(i64),

    /// No matching response within the bounded wait
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// The node answered with `success: false`
    #[error("Command failed: {0}")]
    CommandFailed(String),

    /// Frame could not be decoded or decrypted
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Invalid command arguments
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Crypto error (from meshpanel-crypto)
    #[error("Crypto error: {0}")]
    Crypto(#[from] meshpanel_crypto::CryptoError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for control channel operations
pub type NetworkResult<T> = Result<T, NetworkError>;
