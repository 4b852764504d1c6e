//! SHA-1 digests used for piece verification.

use sha1::{Digest, Sha1};

/// Length of a SHA-1 digest in bytes.
pub const DIGEST_LEN: usize = 20;

pub fn piece_digest(data: &[u8]) -> [u8; DIGEST_LEN] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut hash = [0u8; DIGEST_LEN];
    hash.copy_from_slice(&result);
    hash
}

/// Returns true when `data` hashes to `expected`.
pub fn verify_piece(data: &[u8], expected: &[u8; DIGEST_LEN]) -> bool {
    &piece_digest(data) == expected
}
