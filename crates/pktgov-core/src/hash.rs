//! SHA-256 over canonical bytes.
//!
//! One hashing discipline for everything: action envelopes, pre/post
//! states, commits, the constitution document, and checkpoints all hash
//! the same way: SHA-256 over canonical JSON bytes, lowercase hex output.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::canonical::{self, CanonicalError};

/// Hash algorithm identifier recorded in the dcl-config lock.
pub const HASH_ALGORITHM: &str = "sha256";

/// SHA-256 of raw bytes, lowercase hex.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// SHA-256 of a JSON value's canonical bytes.
///
/// # Errors
///
/// Returns [`CanonicalError`] when the value cannot be canonicalized.
pub fn hash_value(value: &Value) -> Result<String, CanonicalError> {
    canonical::canonical_bytes(value).map(|bytes| sha256_hex(&bytes))
}

/// SHA-256 of any serde value's canonical bytes.
///
/// # Errors
///
/// Returns [`CanonicalError`] when the value cannot be serialized or
/// canonicalized.
pub fn hash_serializable<T: Serialize>(value: &T) -> Result<String, CanonicalError> {
    canonical::to_canonical_string(value).map(|s| sha256_hex(s.as_bytes()))
}
