//! Content hashing for the CAS layer.

use sha2::{Digest, Sha256};

/// Lower-hex SHA-256 of `bytes`. Doubles as the etag callers see.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
