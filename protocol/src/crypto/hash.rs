//! # Hashing Utilities
//!
//! SHA-256 is the only hash the mint speaks natively: hash-to-curve, key
//! derivation, and keyset identifiers are all defined over it. Script
//! verification also needs HASH160, which comes from the `bitcoin` crate.

use bitcoin::hashes::{hash160, Hash};
use sha2::{Digest, Sha256};

/// Compute the SHA-256 hash of the input data as a fixed-size array.
///
/// # Example
///
/// ```
/// use ecash_protocol::crypto::sha256;
///
/// let hash = sha256(b"ecash");
/// assert_eq!(hash.len(), 32);
/// ```
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 over several parts, without concatenating them first.
pub fn sha256_multi(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Lowercase hex of the SHA-256 digest.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// RIPEMD160(SHA256(data)), the hash behind P2SH addresses.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    hash160::Hash::hash(data).to_byte_array()
}
