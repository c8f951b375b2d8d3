//! WireGuard key material

use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::types::WG_KEY_LEN;
use crate::{Error, Result};

/// WireGuard key pair, both halves base64 encoded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WgKeyPair {
    pub private_key: String,
    pub public_key: String,
}

/// Generate a WireGuard key pair using x25519
pub fn generate_keypair() -> WgKeyPair {
    let mut private_key_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut private_key_bytes);

    // Curve25519 clamping, as `wg genkey` does
    private_key_bytes[0] &= 248;
    private_key_bytes[31] &= 127;
    private_key_bytes[31] |= 64;

    let secret = StaticSecret::from(private_key_bytes);
    let public = PublicKey::from(&secret);

    WgKeyPair {
        private_key: STANDARD.encode(private_key_bytes),
        public_key: STANDARD.encode(public.as_bytes()),
    }
}

/// Derive the public key of a base64 private key
pub fn public_key_from_private(private_key: &str) -> Result<String> {
    let bytes: [u8; 32] = decode_key(private_key)?;
    let public = PublicKey::from(&StaticSecret::from(bytes));
    Ok(STANDARD.encode(public.as_bytes()))
}

/// Decode a base64 WireGuard key into its 32 raw bytes
pub fn decode_key(key: &str) -> Result<[u8; 32]> {
    if key.len() != WG_KEY_LEN {
        return Err(Error::InvalidPeerConfig(format!(
            "key must be {} characters, got {}",
            WG_KEY_LEN,
            key.len()
        )));
    }
    let bytes = STANDARD
        .decode(key)
        .map_err(|e| Error::InvalidPeerConfig(format!("key is not valid base64: {}", e)))?;
    bytes
        .try_into()
        .map_err(|_| Error::InvalidPeerConfig("key does not decode to 32 bytes".to_string()))
}
