//! Cryptographic error types

use thiserror::Error;

/// Errors that can occur while sealing or opening control payloads
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Node secret is empty, no key can be derived
    #[error("Empty node secret")]
    EmptySecret,

    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed (authentication failed or corrupted data)
    #[error("Decryption failed: authentication or integrity check failed")]
    DecryptionFailed,

    /// Sealed payload is not valid base64 or too short
    #[error("Malformed sealed payload: {0}")]
    MalformedPayload(String),
}

/// Result type for cryptographic operations
pub type CryptoResult<T> = Result<T, CryptoError>;
