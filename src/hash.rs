//! SHA-256 helpers for cache keys and content hashes.

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of `input`.
pub(crate) fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
