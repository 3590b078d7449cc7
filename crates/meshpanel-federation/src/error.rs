//! Federation error types

use thiserror::Error;

/// Federation call errors, classified by what the caller can do about them
#[derive(Debug, Error)]
pub enum FederationError {
    /// Bad or unknown share token
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Share disabled, expired, over quota or caller IP not allowed
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The share has no free port left
    #[error("Capacity exhausted: {0}")]
    CapacityExhausted(String),

    /// Connect failure, timeout or server-side error
    #[error("Remote unreachable: {0}")]
    RemoteUnreachable(String),

    /// The remote panel refused the request
    #[error("Remote rejected request ({code}): {msg}")]
    Rejected { code: i64, msg: String },

    /// Response body did not match the API envelope
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// Request could not be built from the given arguments
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl FederationError {
    /// Whether retrying the same call later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RemoteUnreachable(_))
    }
}

/// Result type for federation calls
pub type FederationResult<T> = Result<T, FederationError>;
