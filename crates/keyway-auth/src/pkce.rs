//! PKCE (RFC 7636) verifier/challenge pairs and state nonces.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// A fresh `code_verifier` and its S256 `code_challenge`.
#[derive(Clone)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

impl PkcePair {
    /// 64 hex characters of randomness, inside the 43..=128 range RFC 7636 allows.
    pub fn generate() -> Self {
        let verifier = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        let challenge = challenge_for(&verifier);
        Self { verifier, challenge }
    }
}

/// `BASE64URL(SHA256(verifier))` without padding.
pub fn challenge_for(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Opaque 128-bit state nonce. Carries no session or task information.
pub fn new_state() -> String {
    Uuid::new_v4().simple().to_string()
}
