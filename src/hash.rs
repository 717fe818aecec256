//! Hashing utilities for the policy engine.

use sha2::{Digest, Sha256};

/// Computes SHA-256 hash of data and returns hex string.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Computes SHA-256 hash of a string.
pub fn sha256_str(s: &str) -> String {
    sha256_hex(s.as_bytes())
}

/// Fingerprint of generated source text, prefixed with the algorithm.
pub fn source_digest(source: &str) -> String {
    format!("sha256:{}", sha256_str(source))
}
