//! Blinding on the way out, unblinding on the way back.

use std::collections::BTreeMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bitcoin::secp256k1::{PublicKey, SecretKey};
use rand::RngCore;

use super::error::{WalletError, WalletResult};
use crate::config::P2SH_SECRET_PREFIX;
use crate::crypto::bdhke;
use crate::types::{BlindedMessage, BlindedSignature, Proof};

/// Bytes of randomness in a fresh secret.
const SECRET_ENTROPY: usize = 16;

/// Random base64url secret.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_ENTROPY];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Secret spendable only by whoever can unlock the P2SH `address`.
pub fn generate_locked_secret(address: &str) -> String {
    format!("{P2SH_SECRET_PREFIX}:{address}:{}", generate_secret())
}

/// Blind one secret per amount. Returns the messages for the mint and the
/// blinding factors needed to unblind its answer, index for index.
pub fn construct_outputs(
    amounts: &[u64],
    secrets: &[String],
) -> WalletResult<(Vec<BlindedMessage>, Vec<SecretKey>)> {
    if amounts.len() != secrets.len() {
        return Err(WalletError::OutputMismatch {
            expected: amounts.len(),
            got: secrets.len(),
        });
    }
    let mut messages = Vec::with_capacity(amounts.len());
    let mut blinding_factors = Vec::with_capacity(amounts.len());
    for (amount, secret) in amounts.iter().zip(secrets) {
        let (b_, r) = bdhke::blind_message(secret.as_bytes(), None)?;
        messages.push(BlindedMessage { amount: *amount, b_ });
        blinding_factors.push(r);
    }
    Ok((messages, blinding_factors))
}

/// Unblind the mint's promises into spendable proofs.
///
/// `keys` are the public keys of the keyset that signed; every promise's
/// amount must have one.
pub fn construct_proofs(
    promises: &[BlindedSignature],
    secrets: &[String],
    blinding_factors: &[SecretKey],
    keys: &BTreeMap<u64, PublicKey>,
) -> WalletResult<Vec<Proof>> {
    if promises.len() != secrets.len() || promises.len() != blinding_factors.len() {
        return Err(WalletError::OutputMismatch {
            expected: secrets.len(),
            got: promises.len(),
        });
    }
    promises
        .iter()
        .zip(secrets.iter().zip(blinding_factors))
        .map(|(promise, (secret, r))| {
            let mint_key = keys
                .get(&promise.amount)
                .ok_or(WalletError::MissingKey(promise.amount))?;
            let c = bdhke::unblind(&promise.c_, r, mint_key)?;
            Ok(Proof::new(promise.id.clone(), promise.amount, secret.clone(), c))
        })
        .collect()
}
