//! Keccak-256 hashing primitives (component A).

use sha3::{Digest, Keccak256};

pub const HASH_LENGTH: usize = 32;
pub type Hash = [u8; HASH_LENGTH];

/// Keccak-256 of a single input.
pub fn hash1(input: &[u8]) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update(input);
    hasher.finalize().into()
}

/// Keccak-256 of two concatenated inputs, fed to a single hasher.
pub fn hash2(left: &[u8], right: &[u8]) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Leaf identity for a user key/value pair: `Keccak(K || V)`.
pub fn leaf_hash(key: &[u8], value: &[u8]) -> Hash {
    hash2(key, value)
}
