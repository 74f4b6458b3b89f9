use base64::prelude::*;
use boringtun::x25519::{PublicKey, StaticSecret};

use crate::error::{ConfigError, Result};

/// Encode a key to base64
pub fn encode_key(key: &[u8; 32]) -> String {
    BASE64_STANDARD.encode(key)
}

/// Encode a key to lowercase hex, as the control socket expects
pub fn encode_key_hex(key: &[u8; 32]) -> String {
    hex::encode(key)
}

/// Decode a base64-encoded 32-byte key
pub fn decode_key(s: &str) -> Result<[u8; 32]> {
    let bytes = BASE64_STANDARD
        .decode(s.trim())
        .map_err(|e| ConfigError::InvalidKey(format!("Invalid base64: {}", e)))?;

    if bytes.len() != 32 {
        return Err(ConfigError::InvalidKey(format!(
            "Key must be 32 bytes, got {}",
            bytes.len()
        ))
        .into());
    }

    let mut key_bytes = [0u8; 32];
    key_bytes.copy_from_slice(&bytes);
    Ok(key_bytes)
}

/// Decode a hex-encoded 32-byte key
pub fn decode_key_hex(s: &str) -> Option<[u8; 32]> {
    let mut key_bytes = [0u8; 32];
    hex::decode_to_slice(s, &mut key_bytes).ok()?;
    Some(key_bytes)
}

/// Generate a new private key
pub fn generate_private_key() -> StaticSecret {
    StaticSecret::random_from_rng(rand::rngs::OsRng)
}

/// Derive public key from private key
pub fn derive_public_key(private_key: &StaticSecret) -> PublicKey {
    PublicKey::from(private_key)
}
