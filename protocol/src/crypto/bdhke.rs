//! # Blind Diffie-Hellman Key Exchange (BDHKE)
//!
//! The blind-signature scheme at the heart of the mint. Three parties,
//! one curve (secp256k1), no pairing magic:
//!
//! ```text
//! Alice (wallet)                          Bob (mint, key a, A = a*G)
//! --------------                          --------------------------
//! Y  = hash_to_curve(secret)
//! B_ = Y + r*G             ---- B_ --->
//!                                         C_ = a*B_
//!                          <--- C_ ----
//! C  = C_ - r*A  (= a*Y)
//!
//! later, spending:         -- (secret, C) -->
//!                                         a*hash_to_curve(secret) == C ?
//! ```
//!
//! Bob never sees `Y` when signing, so he can't link the issued `C_` to the
//! `(secret, C)` pair that comes back later. He can still check it's his
//! signature, because only he knows `a`.
//!
//! ## Two hash-to-curve variants
//!
//! Older wallets hashed to the curve by hex-encoding the digest and feeding
//! the ASCII bytes to the point parser. Proofs minted that way still exist,
//! so [`verify`] tries [`hash_to_curve`] first and then
//! [`legacy_hash_to_curve`]. The legacy path is a compatibility shim and
//! nothing new should ever be produced with it.

use std::sync::LazyLock;

use bitcoin::secp256k1::{self, All, PublicKey, Scalar, Secp256k1, SecretKey};
use thiserror::Error;

use super::hash::sha256;

/// Shared secp256k1 context. Building one is expensive, so there is exactly one.
pub static SECP: LazyLock<Secp256k1<All>> = LazyLock::new(Secp256k1::new);

/// Hash-to-curve gives up after this many rounds. Each round succeeds with
/// probability ~1/2, so reaching this bound means something is very wrong.
const MAX_HASH_TO_CURVE_ROUNDS: u32 = 1 << 16;

/// Errors surfaced by the curve primitive.
#[derive(Debug, Error)]
pub enum BdhkeError {
    /// A point or scalar failed to parse, or an operation hit infinity.
    #[error("secp256k1 error: {0}")]
    Secp256k1(#[from] secp256k1::Error),

    /// Hash-to-curve exhausted its round budget.
    #[error("no curve point found after {0} rounds")]
    NoCurvePoint(u32),

    /// Hex or length problems decoding a point.
    #[error("invalid point encoding: {0}")]
    InvalidPoint(String),
}

pub type BdhkeResult<T> = Result<T, BdhkeError>;

// ---------------------------------------------------------------------------
// Hash to curve
// ---------------------------------------------------------------------------

/// Map a message to a curve point with even parity.
///
/// `h = sha256(msg)`; if `0x02 || h` is a valid compressed point, done.
/// Otherwise hash `h` again and retry.
pub fn hash_to_curve(message: &[u8]) -> BdhkeResult<PublicKey> {
    let mut digest = sha256(message);
    for _ in 0..MAX_HASH_TO_CURVE_ROUNDS {
        let mut candidate = [0u8; 33];
        candidate[0] = 0x02;
        candidate[1..].copy_from_slice(&digest);
        if let Ok(point) = PublicKey::from_slice(&candidate) {
            return Ok(point);
        }
        digest = sha256(&digest);
    }
    Err(BdhkeError::NoCurvePoint(MAX_HASH_TO_CURVE_ROUNDS))
}

/// Hash-to-curve as older wallets did it.
///
/// The digest is hex-encoded and the first 33 ASCII bytes of that string,
/// with byte 0 forced to `0x02`, are parsed as a compressed point. On
/// failure those same 33 bytes are hashed for the next round.
pub fn legacy_hash_to_curve(message: &[u8]) -> BdhkeResult<PublicKey> {
    let mut msg = message.to_vec();
    for _ in 0..MAX_HASH_TO_CURVE_ROUNDS {
        let hex_digest = hex::encode(sha256(&msg));
        let mut candidate = hex_digest.as_bytes()[..33].to_vec();
        candidate[0] = 0x02;
        if let Ok(point) = PublicKey::from_slice(&candidate) {
            return Ok(point);
        }
        msg = candidate;
    }
    Err(BdhkeError::NoCurvePoint(MAX_HASH_TO_CURVE_ROUNDS))
}

// ---------------------------------------------------------------------------
// The three steps
// ---------------------------------------------------------------------------

/// Draw a fresh blinding factor from the thread RNG.
pub fn random_blinding_factor() -> SecretKey {
    SecretKey::new(&mut rand::thread_rng())
}

/// Step 1 (wallet): `B_ = hash_to_curve(secret) + r*G`.
pub fn blind(secret: &[u8], r: &SecretKey) -> BdhkeResult<PublicKey> {
    let y = hash_to_curve(secret)?;
    let r_g = PublicKey::from_secret_key(&SECP, r);
    Ok(y.combine(&r_g)?)
}

/// Step 1 with an optional caller-supplied blinding factor.
///
/// Returns the blinded point together with the factor that was used, so the
/// wallet can unblind later. Pass `None` in production.
pub fn blind_message(
    secret: &[u8],
    blinding_factor: Option<SecretKey>,
) -> BdhkeResult<(PublicKey, SecretKey)> {
    let r = blinding_factor.unwrap_or_else(random_blinding_factor);
    Ok((blind(secret, &r)?, r))
}

/// Step 2 (mint): `C_ = a*B_`.
pub fn sign(blinded: &PublicKey, private_key: &SecretKey) -> BdhkeResult<PublicKey> {
    Ok(blinded.mul_tweak(&SECP, &Scalar::from(*private_key))?)
}

/// Step 3 (wallet): `C = C_ - r*A`.
pub fn unblind(
    blind_signature: &PublicKey,
    r: &SecretKey,
    mint_public_key: &PublicKey,
) -> BdhkeResult<PublicKey> {
    let r_a = mint_public_key.mul_tweak(&SECP, &Scalar::from(*r))?;
    Ok(blind_signature.combine(&r_a.negate(&SECP))?)
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// Check `a*hash_to_curve(secret) == C` using the current mapping only.
pub fn verify_current(secret: &[u8], c: &PublicKey, private_key: &SecretKey) -> BdhkeResult<bool> {
    let y = hash_to_curve(secret)?;
    Ok(sign(&y, private_key)? == *c)
}

/// Check `a*legacy_hash_to_curve(secret) == C`.
pub fn verify_legacy(secret: &[u8], c: &PublicKey, private_key: &SecretKey) -> BdhkeResult<bool> {
    let y = legacy_hash_to_curve(secret)?;
    Ok(sign(&y, private_key)? == *c)
}

/// Verify a proof signature, accepting both hash-to-curve variants.
///
/// The current mapping is tried first. Only when it fails does the legacy
/// mapping get a chance, so proofs minted by old wallets keep working.
pub fn verify(secret: &[u8], c: &PublicKey, private_key: &SecretKey) -> BdhkeResult<bool> {
    if verify_current(secret, c, private_key)? {
        return Ok(true);
    }
    verify_legacy(secret, c, private_key)
}

/// Parse a hex-encoded compressed (or uncompressed) point.
pub fn point_from_hex(encoded: &str) -> BdhkeResult<PublicKey> {
    let bytes = hex::decode(encoded).map_err(|e| BdhkeError::InvalidPoint(e.to_string()))?;
    Ok(PublicKey::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> SecretKey {
        SecretKey::from_slice(&[byte; 32]).unwrap()
    }

    #[test]
    fn hash_to_curve_known_vector() {
        let expected = point_from_hex(
            "049595c9df90075148eb06860365df33584b75bff782a510c6cd4883a419833d50\
             bbf2e883bdb76cdbb58e57fc0a2df3bcadf9413358a603d7485d572589df9676",
        )
        .unwrap();
        assert_eq!(hash_to_curve(b"hello").unwrap(), expected);
        assert_eq!(
            hex::encode(expected.serialize()),
            "029595c9df90075148eb06860365df33584b75bff782a510c6cd4883a419833d50"
        );
    }

    #[test]
    fn hash_to_curve_is_deterministic_and_even() {
        let a = hash_to_curve(b"test_message").unwrap();
        let b = hash_to_curve(b"test_message").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.serialize()[0], 0x02);
        assert_ne!(a, hash_to_curve(b"other_message").unwrap());
    }

    #[test]
    fn legacy_mapping_differs_from_current() {
        let current = hash_to_curve(b"hello").unwrap();
        let legacy = legacy_hash_to_curve(b"hello").unwrap();
        assert_ne!(current, legacy);
        assert_eq!(legacy, legacy_hash_to_curve(b"hello").unwrap());
    }

    #[test]
    fn round_trip_verifies() {
        let a = key(0x11);
        let big_a = PublicKey::from_secret_key(&SECP, &a);
        let secret = b"a very random secret";

        let (b_, r) = blind_message(secret, None).unwrap();
        let c_ = sign(&b_, &a).unwrap();
        let c = unblind(&c_, &r, &big_a).unwrap();

        assert!(verify(secret, &c, &a).unwrap());
        assert!(verify_current(secret, &c, &a).unwrap());
    }

    #[test]
    fn fixed_blinding_factor_is_reproducible() {
        let r = key(0x01);
        let first = blind(b"test_message", &r).unwrap();
        let second = blind_message(b"test_message", Some(r)).unwrap().0;
        assert_eq!(first, second);
    }

    #[test]
    fn tampering_breaks_verification() {
        let a = key(0x22);
        let big_a = PublicKey::from_secret_key(&SECP, &a);
        let (b_, r) = blind_message(b"secret", None).unwrap();
        let c = unblind(&sign(&b_, &a).unwrap(), &r, &big_a).unwrap();

        // Different secret.
        assert!(!verify(b"secreT", &c, &a).unwrap());
        // Different key.
        assert!(!verify(b"secret", &c, &key(0x23)).unwrap());
        // Different signature point.
        let other = PublicKey::from_secret_key(&SECP, &key(0x33));
        assert!(!verify(b"secret", &other, &a).unwrap());
    }

    #[test]
    fn legacy_signatures_still_verify() {
        let a = key(0x44);
        let y = legacy_hash_to_curve(b"old wallet secret").unwrap();
        let c = sign(&y, &a).unwrap();

        assert!(!verify_current(b"old wallet secret", &c, &a).unwrap());
        assert!(verify_legacy(b"old wallet secret", &c, &a).unwrap());
        assert!(verify(b"old wallet secret", &c, &a).unwrap());
    }

    #[test]
    fn malformed_points_are_decode_errors() {
        assert!(point_from_hex("zz").is_err());
        assert!(point_from_hex("02deadbeef").is_err());
    }
}
