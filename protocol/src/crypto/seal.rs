//! # Payment-Hash Sealing
//!
//! The payment hash of a mint invoice is printed inside the BOLT11 string
//! itself. If `POST /mint` accepted the raw hash, anyone who saw the invoice
//! (a payer, a block explorer, a shoulder surfer) could claim the tokens
//! before the person who requested them.
//!
//! So the mint hands out a *sealed* hash instead: AES-256-GCM under a key
//! derived from the master secret, with a random 96-bit nonce. Only the
//! requester receives the sealed form, and only the mint can open it.
//!
//! ## Wire format
//!
//! `hex(nonce || ciphertext || tag)`. The purpose string is bound in as AAD
//! so a sealed blob from some other context can't be replayed here.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use thiserror::Error;

use super::hash::sha256;

/// AES-256-GCM nonce length in bytes.
const NONCE_LENGTH: usize = 12;

/// Authenticated context for every sealed payment hash.
const SEAL_AAD: &[u8] = b"ecash/payment-hash/v1";

/// Kept vague on purpose: "wrong key" and "tampered" look the same.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SealError {
    #[error("sealing failed")]
    SealFailed,

    #[error("sealed payment hash is invalid or was not issued by this mint")]
    OpenFailed,

    #[error("sealed payment hash is not valid hex")]
    InvalidEncoding,
}

/// Seals and opens payment hashes with a key derived from the master secret.
#[derive(Clone)]
pub struct PaymentHashSealer {
    key: [u8; 32],
}

impl PaymentHashSealer {
    /// Derive the sealing key as `sha256(master_secret)`.
    pub fn from_master_secret(master_secret: &str) -> Self {
        Self {
            key: sha256(master_secret.as_bytes()),
        }
    }

    /// Seal a payment hash for handing out to the invoice requester.
    pub fn seal(&self, payment_hash: &str) -> Result<String, SealError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|_| SealError::SealFailed)?;

        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: payment_hash.as_bytes(),
                    aad: SEAL_AAD,
                },
            )
            .map_err(|_| SealError::SealFailed)?;

        let mut out = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(hex::encode(out))
    }

    /// Recover the payment hash from its sealed form.
    pub fn open(&self, sealed: &str) -> Result<String, SealError> {
        let data = hex::decode(sealed).map_err(|_| SealError::InvalidEncoding)?;
        if data.len() < NONCE_LENGTH {
            return Err(SealError::OpenFailed);
        }

        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LENGTH);
        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|_| SealError::OpenFailed)?;
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: SEAL_AAD,
                },
            )
            .map_err(|_| SealError::OpenFailed)?;

        String::from_utf8(plaintext).map_err(|_| SealError::OpenFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "5d3a9c7e0b1f2a4c6e8d0f1a3b5c7d9e1f2a4b6c8d0e1f3a5b7c9d1e3f5a7b9c";

    #[test]
    fn seal_open_roundtrip() {
        let sealer = PaymentHashSealer::from_master_secret("supersecret");
        let sealed = sealer.seal(HASH).unwrap();
        assert_ne!(sealed, HASH);
        assert_eq!(sealer.open(&sealed).unwrap(), HASH);
    }

    #[test]
    fn sealing_twice_gives_different_tokens() {
        let sealer = PaymentHashSealer::from_master_secret("supersecret");
        assert_ne!(sealer.seal(HASH).unwrap(), sealer.seal(HASH).unwrap());
    }

    #[test]
    fn other_mint_cannot_open() {
        let ours = PaymentHashSealer::from_master_secret("supersecret");
        let theirs = PaymentHashSealer::from_master_secret("another secret");
        let sealed = ours.seal(HASH).unwrap();
        assert_eq!(theirs.open(&sealed), Err(SealError::OpenFailed));
    }

    #[test]
    fn tampered_token_is_rejected() {
        let sealer = PaymentHashSealer::from_master_secret("supersecret");
        let mut raw = hex::decode(sealer.seal(HASH).unwrap()).unwrap();
        raw[NONCE_LENGTH] ^= 0xFF;
        assert_eq!(sealer.open(&hex::encode(raw)), Err(SealError::OpenFailed));
    }

    #[test]
    fn garbage_input_is_rejected() {
        let sealer = PaymentHashSealer::from_master_secret("supersecret");
        assert_eq!(sealer.open("not hex"), Err(SealError::InvalidEncoding));
        assert_eq!(sealer.open("abcd"), Err(SealError::OpenFailed));
        // A raw payment hash is valid hex but not a sealed token.
        assert_eq!(sealer.open(HASH), Err(SealError::OpenFailed));
    }
}
