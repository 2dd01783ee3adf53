//! Digest and comparison helpers shared by the detectors.

use rand::RngCore;
use sha2::{Digest, Sha256};

/// Constant-time byte comparison.
///
/// Compares every byte regardless of where the first mismatch occurs, so
/// token checks do not leak the matching prefix length through timing.
#[inline(never)]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }

    result == 0
}

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Random 64-bit identifier, hex encoded.
pub fn random_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Check an administrative token against its configured SHA-256 digest.
///
/// The digest is compared case-insensitively; a malformed digest never
/// matches.
pub fn verify_admin_token(token: &str, expected_sha256_hex: &str) -> bool {
    let Ok(expected) = hex::decode(expected_sha256_hex.trim()) else {
        return false;
    };
    if expected.len() != 32 {
        return false;
    }
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    let actual = hasher.finalize();
    constant_time_eq(&expected, &actual)
}
