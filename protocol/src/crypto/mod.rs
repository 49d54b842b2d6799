//! # Cryptographic Primitives
//!
//! Everything the mint signs, verifies, or hashes goes through here.
//!
//! - **bdhke**: blind Diffie-Hellman key exchange over secp256k1, the
//!   blind-signature scheme behind every token.
//! - **keyset**: deterministic per-denomination key derivation.
//! - **hash**: SHA-256 and HASH160 helpers.
//! - **seal**: AES-256-GCM sealing of invoice payment hashes.
//!
//! All curve arithmetic is delegated to libsecp256k1 through the `bitcoin`
//! crate. Nothing here implements field or group operations by hand.

pub mod bdhke;
pub mod hash;
pub mod keyset;
pub mod seal;

pub use bdhke::{
    blind, blind_message, hash_to_curve, legacy_hash_to_curve, sign, unblind, verify, BdhkeError,
    SECP,
};
pub use hash::{hash160, sha256, sha256_hex};
pub use keyset::{derive_keyset_id, KeySet, KeySetError, KeySetInfo};
pub use seal::{PaymentHashSealer, SealError};
