//! Orchestration errors
//!
//! Lower layer errors are folded in with their class preserved, so a caller
//! can tell a full share from a bad token from a flaky peer.

use meshpanel_core::CoreError;
use meshpanel_federation::FederationError;
use meshpanel_network::NetworkError;
use thiserror::Error;

/// Orchestration errors
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("Port exhausted on node {node_id}")]
    PortExhausted { node_id: i64 },

    #[error("Capacity exhausted: {0}")]
    CapacityExhausted(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Remote unreachable: {0}")]
    RemoteUnreachable(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Node {0} is offline")]
    NodeOffline(i64),

    /// Node answered a command with `success: false`
    #[error("Command failed: {0}")]
    CommandFailed(String),

    /// Peer panel refused the call for a reason outside the known classes
    #[error("Rejected by peer ({code}): {msg}")]
    Rejected { code: i64, msg: String },

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl ControlError {
    /// Whether trying the same call again later can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RemoteUnreachable(_) | Self::Timeout(_) | Self::NodeOffline(_) | Self::Conflict(_)
        )
    }
}

impl From<CoreError> for ControlError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotFound(what) => Self::NotFound(what),
            CoreError::PortExhausted { node_id } => Self::PortExhausted { node_id },
            CoreError::CapacityExhausted(msg) => Self::CapacityExhausted(msg),
            CoreError::Unauthorized => Self::Unauthorized("invalid share token".into()),
            CoreError::Forbidden(msg) => Self::Forbidden(msg),
            CoreError::RemoteUnreachable(msg) => Self::RemoteUnreachable(msg),
            CoreError::Timeout => Self::Timeout("operation timed out".into()),
            CoreError::MalformedMessage(msg) => Self::MalformedMessage(msg),
            CoreError::InvalidInput(msg) => Self::InvalidInput(msg),
            CoreError::Conflict(msg) => Self::Conflict(msg),
            err @ (CoreError::Serialization(_) | CoreError::Database(_)) => Self::Storage(err.to_string()),
        }
    }
}

impl From<NetworkError> for ControlError {
    fn from(err: NetworkError) -> Self {
        match err {
            NetworkError::NodeOffline(node_id) | NetworkError::Disconnected(node_id) => Self::NodeOffline(node_id),
            NetworkError::Timeout(msg) => Self::Timeout(msg),
            NetworkError::CommandFailed(msg) => Self::CommandFailed(msg),
            NetworkError::InvalidCommand(msg) => Self::InvalidInput(msg),
            err @ (NetworkError::Malformed(_) | NetworkError::Crypto(_) | NetworkError::Serialization(_)) => {
                Self::MalformedMessage(err.to_string())
            }
        }
    }
}

impl From<FederationError> for ControlError {
    fn from(err: FederationError) -> Self {
        match err {
            FederationError::Unauthorized(msg) => Self::Unauthorized(msg),
            FederationError::Forbidden(msg) => Self::Forbidden(msg),
            FederationError::CapacityExhausted(msg) => Self::CapacityExhausted(msg),
            FederationError::RemoteUnreachable(msg) => Self::RemoteUnreachable(msg),
            FederationError::Rejected { code, msg } => Self::Rejected { code, msg },
            FederationError::Malformed(msg) => Self::MalformedMessage(msg),
            FederationError::InvalidRequest(msg) => Self::InvalidInput(msg),
        }
    }
}

/// Result type for orchestration
pub type ControlResult<T> = Result<T, ControlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classes_survive_conversion() {
        let err: ControlError = FederationError::CapacityExhausted("No available port".into()).into();
        assert!(matches!(err, ControlError::CapacityExhausted(ref m) if m == "No available port"));
        assert!(!err.is_retryable());

        let err: ControlError = FederationError::RemoteUnreachable("connect refused".into()).into();
        assert!(err.is_retryable());

        let err: ControlError = CoreError::PortExhausted { node_id: 3 }.into();
        assert!(matches!(err, ControlError::PortExhausted { node_id: 3 }));

        let err: ControlError = NetworkError::Disconnected(9).into();
        assert!(matches!(err, ControlError::NodeOffline(9)));
    }

    #[test]
    fn test_unauthorized_is_fatal() {
        let err: ControlError = CoreError::Unauthorized.into();
        assert!(matches!(err, ControlError::Unauthorized(_)));
        assert!(!err.is_retryable());
    }
}
