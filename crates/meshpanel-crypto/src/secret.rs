//! Secret generation
//!
//! Node secrets identify a node on the control channel; share tokens are the
//! bearer credential a consumer panel presents to a provider panel.

use rand::RngCore;

use crate::constants::{NODE_SECRET_BYTES, SHARE_TOKEN_BYTES};

/// Generate a new node secret (hex)
pub fn generate_node_secret() -> String {
    random_hex(NODE_SECRET_BYTES)
}

/// Generate a new peer share token (hex)
pub fn generate_share_token() -> String {
    random_hex(SHARE_TOKEN_BYTES)
}

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_shape() {
        let token = generate_share_token();
        assert_eq!(token.len(), SHARE_TOKEN_BYTES * 2);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_tokens_differ() {
        assert_ne!(generate_share_token(), generate_share_token());
        assert_ne!(generate_node_secret(), generate_node_secret());
    }
}
