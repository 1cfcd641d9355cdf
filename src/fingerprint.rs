// src/fingerprint.rs
//
// =============================================================================
// DATALAB: CONTENT FINGERPRINTS
// =============================================================================
//
// SHA256 over canonical JSON. Used to tag in-flight checks with the exact
// step state they were issued for, and to detect unchanged saves.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Calculates SHA256 of a byte slice.
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Fingerprint of any serializable value.
/// A value that fails to serialize hashes as empty input.
pub fn of<T: Serialize>(value: &T) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    sha256_bytes(&bytes)
}
