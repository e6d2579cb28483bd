//! Content-addressed lookup keys.

use sha2::{Digest, Sha256};

/// SHA-256 hex digest of a serialized signature.
///
/// Used as the indexed half of the `(cache_key, signature_hash)` primary key;
/// the full JSON is stored alongside to rule out collisions.
pub fn signature_hash(signature_json: &str) -> String {
    hex::encode(Sha256::digest(signature_json.as_bytes()))
}
