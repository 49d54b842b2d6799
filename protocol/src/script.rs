//! # P2SH Script Locks
//!
//! A proof can be locked to a Bitcoin script. Its secret then reads
//! `P2SH:<address>:<nonce>`, and spending it requires a script attachment
//! carrying the redeem script and a scriptSig that satisfies it.
//!
//! Nothing is ever broadcast. The mint builds a fixed dummy transaction,
//! the same one every wallet builds, and checks the scriptSig would spend
//! its single input:
//!
//! ```text
//! version   1
//! input     bff785da...c617ae:0, sequence 0xffffffff
//! output    50 000 sat to HASH160 <hash160(redeem)> EQUAL
//! locktime  0
//! ```
//!
//! Verification is delegated to libbitcoinconsensus with the P2SH flag:
//! the scriptSig must be push-only and end with the serialized redeem
//! script, the script pubkey checks its hash, and the redeem script then
//! runs on the remaining stack. Signatures commit to the legacy SIGHASH
//! digest of the template.
//!
//! [`P2SHLock`] builds the two locks wallets use: a single key
//! (`<pubkey> CHECKSIG`) and k-of-n `CHECKMULTISIG`.

use std::str::FromStr;

use base64::Engine;
use bitcoinconsensus::VERIFY_P2SH;
use bitcoin::blockdata::opcodes::all::*;
use bitcoin::blockdata::script::{Builder, PushBytesBuf};
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{Message, PublicKey, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::{self, TxIn, TxOut};
use bitcoin::{absolute, Address, Amount, Network, OutPoint, Script, ScriptBuf, Sequence};
use bitcoin::{Transaction, Txid, Witness};
use thiserror::Error;

use crate::config::P2SH_SECRET_PREFIX;
use crate::crypto::bdhke::SECP;
use crate::types::P2SHScript;

/// Outpoint spent by the template transaction.
const TEMPLATE_TXID: &str = "bff785da9f8169f49be92fa95e31f0890c385bfb1bd24d6b94d7900057c617ae";

/// Value of the template output, in sats.
const TEMPLATE_VALUE_SAT: u64 = 50_000;

/// Most keys a bare `CHECKMULTISIG` lock may list.
const MAX_MULTISIG_KEYS: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScriptError {
    #[error("invalid base64 in script attachment: {0}")]
    Decode(String),

    #[error("scriptSig is empty")]
    EmptyScriptSig,

    #[error("redeem script too large for P2SH")]
    RedeemScriptTooLarge,

    #[error("push exceeds the script element limit")]
    PushTooLarge,

    #[error("invalid multisig lock: {threshold} of {keys} keys")]
    InvalidThreshold { threshold: usize, keys: usize },

    #[error("script rejected: {0}")]
    Rejected(String),

    #[error("sighash computation failed: {0}")]
    Sighash(String),
}

pub type ScriptResult<T> = Result<T, ScriptError>;

// ---------------------------------------------------------------------------
// Public entry points
// ---------------------------------------------------------------------------

/// Verify a script attachment and return the P2SH address it unlocks.
///
/// `script` and `signature` are base64url (padded or not), as carried in
/// [`P2SHScript`].
pub fn verify_script(script: &str, signature: &str) -> ScriptResult<Address> {
    let redeem_script = decode_base64url(script)?;
    let script_sig = decode_base64url(signature)?;
    verify_raw(&redeem_script, &script_sig)
}

/// Verify raw redeem-script and scriptSig bytes against the template.
pub fn verify_raw(redeem_script: &[u8], script_sig: &[u8]) -> ScriptResult<Address> {
    if script_sig.is_empty() {
        return Err(ScriptError::EmptyScriptSig);
    }
    let redeem = ScriptBuf::from_bytes(redeem_script.to_vec());
    let address = p2sh_address(&redeem)?;
    verify_spend(&redeem.to_p2sh(), ScriptBuf::from_bytes(script_sig.to_vec()))?;
    Ok(address)
}

/// Check that `script_sig` spends the template output paying `script_pubkey`.
fn verify_spend(script_pubkey: &Script, script_sig: ScriptBuf) -> ScriptResult<()> {
    let mut tx = spending_template(script_pubkey.to_owned());
    tx.input[0].script_sig = script_sig;
    script_pubkey
        .verify_with_flags(
            0,
            Amount::from_sat(TEMPLATE_VALUE_SAT),
            &bitcoin::consensus::serialize(&tx),
            VERIFY_P2SH,
        )
        .map_err(|e| ScriptError::Rejected(e.to_string()))
}

/// Mainnet P2SH address for a redeem script.
pub fn p2sh_address(redeem_script: &Script) -> ScriptResult<Address> {
    Address::p2sh(redeem_script, Network::Bitcoin).map_err(|_| ScriptError::RedeemScriptTooLarge)
}

/// The fixed transaction every lock is checked against.
pub fn spending_template(script_pubkey: ScriptBuf) -> Transaction {
    // The constant is a valid txid; a parse failure would be a typo caught by tests.
    let txid = Txid::from_str(TEMPLATE_TXID).unwrap_or_else(|_| Txid::all_zeros());
    Transaction {
        version: transaction::Version::ONE,
        lock_time: absolute::LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint { txid, vout: 0 },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(TEMPLATE_VALUE_SAT),
            script_pubkey,
        }],
    }
}

// ---------------------------------------------------------------------------
// Wallet side: creating locks
// ---------------------------------------------------------------------------

/// A redeem script wrapped in P2SH.
#[derive(Debug, Clone)]
pub struct P2SHLock {
    pub redeem_script: ScriptBuf,
    pub address: Address,
}

impl P2SHLock {
    /// `<pubkey> OP_CHECKSIG`, wrapped in P2SH.
    pub fn to_public_key(public_key: &PublicKey) -> ScriptResult<Self> {
        let redeem_script = Builder::new()
            .push_key(&bitcoin::PublicKey::new(*public_key))
            .push_opcode(OP_CHECKSIG)
            .into_script();
        Self::from_redeem_script(redeem_script)
    }

    /// `<k> <pubkey>... <n> OP_CHECKMULTISIG`, wrapped in P2SH.
    pub fn multisig(threshold: usize, public_keys: &[PublicKey]) -> ScriptResult<Self> {
        let keys = public_keys.len();
        if threshold == 0 || threshold > keys || keys > MAX_MULTISIG_KEYS {
            return Err(ScriptError::InvalidThreshold { threshold, keys });
        }
        let mut builder = Builder::new().push_int(threshold as i64);
        for key in public_keys {
            builder = builder.push_key(&bitcoin::PublicKey::new(*key));
        }
        let redeem_script = builder
            .push_int(keys as i64)
            .push_opcode(OP_CHECKMULTISIG)
            .into_script();
        Self::from_redeem_script(redeem_script)
    }

    pub fn from_redeem_script(redeem_script: ScriptBuf) -> ScriptResult<Self> {
        let address = p2sh_address(&redeem_script)?;
        Ok(Self {
            redeem_script,
            address,
        })
    }

    /// A fresh secret committing to this lock's address.
    pub fn secret(&self, nonce: &str) -> String {
        format!("{P2SH_SECRET_PREFIX}:{}:{nonce}", self.address)
    }

    /// Produce the script attachment that unlocks a single-key lock.
    pub fn unlock(&self, secret_key: &SecretKey) -> ScriptResult<P2SHScript> {
        let signature = self.sign(secret_key)?;
        self.attachment(Builder::new().push_slice(push_bytes(signature)?))
    }

    /// Produce the attachment for a multisig lock.
    ///
    /// `secret_keys` must follow the order of their public keys in the
    /// redeem script. `CHECKMULTISIG` fails otherwise.
    pub fn unlock_multisig(&self, secret_keys: &[SecretKey]) -> ScriptResult<P2SHScript> {
        // CHECKMULTISIG pops one element more than it uses.
        let mut builder = Builder::new().push_opcode(OP_PUSHBYTES_0);
        for secret_key in secret_keys {
            builder = builder.push_slice(push_bytes(self.sign(secret_key)?)?);
        }
        self.attachment(builder)
    }

    /// DER signature over the template with SIGHASH_ALL appended.
    fn sign(&self, secret_key: &SecretKey) -> ScriptResult<Vec<u8>> {
        let tx = spending_template(self.redeem_script.to_p2sh());
        let message = legacy_sighash(&tx, &self.redeem_script, EcdsaSighashType::All.to_u32())?;
        let mut signature = SECP.sign_ecdsa(&message, secret_key).serialize_der().to_vec();
        signature.push(EcdsaSighashType::All.to_u32() as u8);
        Ok(signature)
    }

    fn attachment(&self, signatures: Builder) -> ScriptResult<P2SHScript> {
        let script_sig = signatures
            .push_slice(push_bytes(self.redeem_script.to_bytes())?)
            .into_script();
        let engine = base64::engine::general_purpose::URL_SAFE;
        Ok(P2SHScript {
            script: engine.encode(self.redeem_script.as_bytes()),
            signature: engine.encode(script_sig.as_bytes()),
            address: Some(self.address.to_string()),
        })
    }
}

fn push_bytes(data: Vec<u8>) -> ScriptResult<PushBytesBuf> {
    PushBytesBuf::try_from(data).map_err(|_| ScriptError::PushTooLarge)
}

fn decode_base64url(encoded: &str) -> ScriptResult<Vec<u8>> {
    let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
    match engine.decode(encoded.trim_end_matches('=')) {
        Ok(bytes) => Ok(bytes),
        Err(e) => Err(ScriptError::Decode(e.to_string())),
    }
}

fn legacy_sighash(tx: &Transaction, script_code: &Script, sighash_type: u32) -> ScriptResult<Message> {
    let sighash = SighashCache::new(tx)
        .legacy_signature_hash(0, script_code, sighash_type)
        .map_err(|e| ScriptError::Sighash(e.to_string()))?;
    Ok(Message::from_digest(sighash.to_byte_array()))
}
