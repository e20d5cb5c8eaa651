use base64::Engine as _;
use sha2::{Digest, Sha256};

use crate::core::error::{McpError, McpResult};

/// 32 random bytes encode to a 43-character verifier, the RFC 7636 minimum.
const VERIFIER_BYTES: usize = 32;
const STATE_BYTES: usize = 24;

pub const CODE_CHALLENGE_METHOD: &str = "S256";

pub fn random_urlsafe(bytes_len: usize) -> McpResult<String> {
    let mut bytes = vec![0_u8; bytes_len];
    getrandom::fill(&mut bytes)
        .map_err(|err| McpError::transport(format!("system randomness unavailable: {err}")))?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

pub fn generate_code_verifier() -> McpResult<String> {
    random_urlsafe(VERIFIER_BYTES)
}

pub fn generate_state() -> McpResult<String> {
    random_urlsafe(STATE_BYTES)
}

pub fn pkce_s256_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest)
}
