//! # Keysets
//!
//! A keyset is the mint's signing identity: one secp256k1 key pair per
//! denomination, `2^0` through `2^63`, all derived from a single master
//! secret and a derivation path.
//!
//! ## Derivation
//!
//! ```text
//! sk_i = sha256(master_secret || derivation_path || decimal(i))  mod n
//! amount(sk_i) = 2^i                                              i in 0..64
//! ```
//!
//! ## Identifier
//!
//! The id is derived from the public keys only, so any wallet that has the
//! keys can recompute it:
//!
//! ```text
//! id = base64(sha256(hex(A_1) || hex(A_2) || hex(A_4) || ...))[..12]
//! ```
//!
//! Order matters, which is why keys live in a `BTreeMap` keyed by amount and
//! are never iterated in any other order.

use std::collections::BTreeMap;
use std::fmt;

use base64::Engine;
use bitcoin::secp256k1::{constants::CURVE_ORDER, PublicKey, SecretKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::bdhke::SECP;
use super::hash::{sha256, sha256_multi};
use crate::config::{KEYSET_ID_LENGTH, MAX_ORDER};

/// Errors raised while deriving or loading keysets.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeySetError {
    /// The derivation hash, reduced modulo the group order, came out as
    /// zero. Digests at or above the order are reduced, not rejected.
    #[error("derived key for amount {amount} is not a valid scalar")]
    InvalidDerivedKey { amount: u64 },

    /// A persisted keyset re-derived to a different id than the one stored.
    /// Usually means the master secret changed between runs.
    #[error("keyset id mismatch: stored {stored}, derived {derived}")]
    IdMismatch { stored: String, derived: String },

    /// No key for this amount in the keyset.
    #[error("no key for amount {0}")]
    UnknownAmount(u64),
}

pub type KeySetResult<T> = Result<T, KeySetError>;

// ---------------------------------------------------------------------------
// Persisted metadata
// ---------------------------------------------------------------------------

/// What gets written to storage for a keyset. No private keys, ever: they
/// are re-derived from the master secret when the mint starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySetInfo {
    pub id: String,
    pub derivation_path: String,
    pub mint_url: String,
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
    pub first_seen: DateTime<Utc>,
    pub active: bool,
}

// ---------------------------------------------------------------------------
// KeySet
// ---------------------------------------------------------------------------

/// A fully derived keyset, private keys included.
#[derive(Clone)]
pub struct KeySet {
    id: String,
    derivation_path: String,
    mint_url: String,
    valid_from: DateTime<Utc>,
    valid_to: Option<DateTime<Utc>>,
    first_seen: DateTime<Utc>,
    active: bool,
    private_keys: BTreeMap<u64, SecretKey>,
    public_keys: BTreeMap<u64, PublicKey>,
}

impl KeySet {
    /// Derive all 64 key pairs and the id from `master_secret` and `derivation_path`.
    pub fn derive(master_secret: &str, derivation_path: &str) -> KeySetResult<Self> {
        let private_keys = derive_private_keys(master_secret, derivation_path)?;
        let public_keys: BTreeMap<u64, PublicKey> = private_keys
            .iter()
            .map(|(amount, sk)| (*amount, PublicKey::from_secret_key(&SECP, sk)))
            .collect();
        let id = derive_keyset_id(&public_keys);
        let now = Utc::now();

        Ok(Self {
            id,
            derivation_path: derivation_path.to_string(),
            mint_url: String::new(),
            valid_from: now,
            valid_to: None,
            first_seen: now,
            active: true,
            private_keys,
            public_keys,
        })
    }

    /// Re-derive a keyset from its persisted metadata.
    ///
    /// Fails with [`KeySetError::IdMismatch`] if the master secret no longer
    /// produces the stored id.
    pub fn from_info(master_secret: &str, info: &KeySetInfo) -> KeySetResult<Self> {
        let mut keyset = Self::derive(master_secret, &info.derivation_path)?;
        if keyset.id != info.id {
            return Err(KeySetError::IdMismatch {
                stored: info.id.clone(),
                derived: keyset.id,
            });
        }
        keyset.mint_url = info.mint_url.clone();
        keyset.valid_from = info.valid_from;
        keyset.valid_to = info.valid_to;
        keyset.first_seen = info.first_seen;
        keyset.active = info.active;
        Ok(keyset)
    }

    /// Builder-style setter for the origin URL.
    pub fn with_mint_url(mut self, mint_url: impl Into<String>) -> Self {
        self.mint_url = mint_url.into();
        self
    }

    /// Mark this keyset as retired. It keeps verifying proofs but stops signing.
    pub fn deactivate(&mut self, at: DateTime<Utc>) {
        self.active = false;
        self.valid_to = Some(at);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn derivation_path(&self) -> &str {
        &self.derivation_path
    }

    pub fn mint_url(&self) -> &str {
        &self.mint_url
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Public keys sorted by amount.
    pub fn public_keys(&self) -> &BTreeMap<u64, PublicKey> {
        &self.public_keys
    }

    pub fn public_key(&self, amount: u64) -> KeySetResult<&PublicKey> {
        self.public_keys
            .get(&amount)
            .ok_or(KeySetError::UnknownAmount(amount))
    }

    pub fn private_key(&self, amount: u64) -> KeySetResult<&SecretKey> {
        self.private_keys
            .get(&amount)
            .ok_or(KeySetError::UnknownAmount(amount))
    }

    /// Metadata suitable for persisting.
    pub fn info(&self) -> KeySetInfo {
        KeySetInfo {
            id: self.id.clone(),
            derivation_path: self.derivation_path.clone(),
            mint_url: self.mint_url.clone(),
            valid_from: self.valid_from,
            valid_to: self.valid_to,
            first_seen: self.first_seen,
            active: self.active,
        }
    }
}

// Private keys stay out of logs.
impl fmt::Debug for KeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySet")
            .field("id", &self.id)
            .field("derivation_path", &self.derivation_path)
            .field("mint_url", &self.mint_url)
            .field("active", &self.active)
            .field("keys", &self.public_keys.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Derivation helpers
// ---------------------------------------------------------------------------

fn derive_private_keys(
    master_secret: &str,
    derivation_path: &str,
) -> KeySetResult<BTreeMap<u64, SecretKey>> {
    (0..MAX_ORDER)
        .map(|i| {
            let amount = 1u64 << i;
            let digest = sha256_multi(&[
                master_secret.as_bytes(),
                derivation_path.as_bytes(),
                i.to_string().as_bytes(),
            ]);
            let scalar = reduce_mod_order(digest);
            SecretKey::from_slice(&scalar)
                .map(|sk| (amount, sk))
                .map_err(|_| KeySetError::InvalidDerivedKey { amount })
        })
        .collect()
}

/// Reduce a 256-bit big-endian integer modulo the secp256k1 group order.
///
/// `2n > 2^256`, so a single conditional subtraction is enough.
fn reduce_mod_order(mut value: [u8; 32]) -> [u8; 32] {
    if value < CURVE_ORDER {
        return value;
    }
    let mut borrow = 0u16;
    for i in (0..32).rev() {
        let lhs = value[i] as u16;
        let rhs = CURVE_ORDER[i] as u16 + borrow;
        if lhs >= rhs {
            value[i] = (lhs - rhs) as u8;
            borrow = 0;
        } else {
            value[i] = (lhs + 256 - rhs) as u8;
            borrow = 1;
        }
    }
    value
}

/// Compute the 12 character keyset id from a set of public keys.
pub fn derive_keyset_id(public_keys: &BTreeMap<u64, PublicKey>) -> String {
    let concatenated: String = public_keys
        .values()
        .map(|pk| hex::encode(pk.serialize()))
        .collect();
    let digest = sha256(concatenated.as_bytes());
    let mut id = base64::engine::general_purpose::STANDARD.encode(digest);
    id.truncate(KEYSET_ID_LENGTH);
    id
}
