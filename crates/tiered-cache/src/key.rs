//! Mapping logical keys to filesystem-safe digests

use sha2::{Digest, Sha256};

/// Digest a logical key into the name of its blob file
///
/// SHA-256 rendered as lowercase hex, so the result is always 64 characters
/// and stable across restarts.
pub fn digest(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Namespace a key for the raw-bytes (image) surface
pub fn image_key(prefix: &str, key: &str) -> String {
    format!("{}{}", prefix, key)
}
