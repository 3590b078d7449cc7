//! Mesh panel cryptographic primitives
//!
//! This crate provides the cryptography used on the node control channel:
//! - Per-node payload keys derived from the node secret (SHA-256)
//! - Authenticated payload encryption (AES-256-GCM)
//! - Random secret and share token generation

pub mod payload;
pub mod secret;
pub mod error;

pub use payload::{open, seal, PayloadKey};
pub use secret::{generate_node_secret, generate_share_token};
pub use error::{CryptoError, CryptoResult};

/// Protocol constants
pub mod constants {
    /// AES-256 key size
    pub const PAYLOAD_KEY_SIZE: usize = 32;

    /// GCM nonce size
    pub const NONCE_SIZE: usize = 12;

    /// GCM authentication tag size
    pub const AUTH_TAG_SIZE: usize = 16;

    /// Random bytes behind a share token (hex encoded on the wire)
    pub const SHARE_TOKEN_BYTES: usize = 32;

    /// Random bytes behind a node secret
    pub const NODE_SECRET_BYTES: usize = 16;
}
