//! Control payload encryption (AES-256-GCM)
//!
//! Every node's key is the SHA-256 digest of its secret. Sealed payloads are
//! carried as base64 text of `[nonce (12 bytes)][ciphertext + tag]` so they fit
//! inside a JSON string field.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{AUTH_TAG_SIZE, NONCE_SIZE, PAYLOAD_KEY_SIZE};
use crate::error::{CryptoError, CryptoResult};

/// A 256-bit per-node payload key
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PayloadKey {
    bytes: [u8; PAYLOAD_KEY_SIZE],
}

impl PayloadKey {
    /// Derive the payload key for a node secret
    pub fn derive(secret: &str) -> CryptoResult<Self> {
        if secret.is_empty() {
            return Err(CryptoError::EmptySecret);
        }

        let mut bytes = [0u8; PAYLOAD_KEY_SIZE];
        bytes.copy_from_slice(&Sha256::digest(secret.as_bytes()));
        Ok(Self { bytes })
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; PAYLOAD_KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for PayloadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PayloadKey(..)")
    }
}

/// Encrypt a plaintext payload and return it as base64 text
pub fn seal(key: &PayloadKey, plaintext: &[u8]) -> CryptoResult<String> {
    let cipher = Aes256Gcm::new_from_slice(&key.bytes)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed("AES-GCM encryption failed".into()))?;

    let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);

    Ok(STANDARD.encode(sealed))
}

/// Decrypt a base64 payload produced by [`seal`]
pub fn open(key: &PayloadKey, sealed: &str) -> CryptoResult<Vec<u8>> {
    let raw = STANDARD
        .decode(sealed.trim())
        .map_err(|e| CryptoError::MalformedPayload(e.to_string()))?;

    if raw.len() < NONCE_SIZE + AUTH_TAG_SIZE {
        return Err(CryptoError::MalformedPayload(format!(
            "payload too short: {} bytes",
            raw.len()
        )));
    }

    let (nonce_bytes, ciphertext) = raw.split_at(NONCE_SIZE);
    let cipher = Aes256Gcm::new_from_slice(&key.bytes)
        .map_err(|_| CryptoError::DecryptionFailed)?;

    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}
