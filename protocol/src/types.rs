//! # Protocol Types
//!
//! The records that cross the wire between wallet and mint, plus the few
//! the mint keeps for itself (promises, spent entries, invoices).
//!
//! Points are kept as `secp256k1::PublicKey` all the way through, so a
//! malformed `B_` or `C` is rejected when the request is decoded rather than
//! halfway through a split. In JSON they are compressed hex strings.
//!
//! Everything here is also persisted with bincode, which is not
//! self-describing. Fields are therefore never conditionally skipped on
//! serialization; local-only bookkeeping is skipped unconditionally.

use bitcoin::secp256k1::PublicKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::P2SH_SECRET_PREFIX;

// ---------------------------------------------------------------------------
// Blinded messages and signatures
// ---------------------------------------------------------------------------

/// A blinded point the wallet wants signed for `amount`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlindedMessage {
    pub amount: u64,
    #[serde(rename = "B_")]
    pub b_: PublicKey,
}

/// The mint's signature over a [`BlindedMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlindedSignature {
    pub amount: u64,
    #[serde(rename = "C_")]
    pub c_: PublicKey,
    /// Keyset that produced the signature.
    pub id: String,
}

/// Mint-side audit record of an issued signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Promise {
    pub amount: u64,
    pub b_: PublicKey,
    pub c_: PublicKey,
    pub keyset_id: String,
    pub created_at: DateTime<Utc>,
}

impl Promise {
    pub fn new(message: &BlindedMessage, signature: &BlindedSignature) -> Self {
        Self {
            amount: message.amount,
            b_: message.b_,
            c_: signature.c_,
            keyset_id: signature.id.clone(),
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Proofs
// ---------------------------------------------------------------------------

/// Script attachment for a P2SH-locked proof. Both fields are base64url.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct P2SHScript {
    pub script: String,
    pub signature: String,
    #[serde(default)]
    pub address: Option<String>,
}

/// Lifecycle of a proof.
///
/// `Unspent -> Pending -> Spent` or straight `Unspent -> Spent`. Spent is
/// terminal. Releasing a pending lock (failed melt) puts the proof back to
/// `Unspent`; nothing ever leaves `Spent`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProofState {
    #[default]
    Unspent,
    Pending,
    Spent,
}

impl ProofState {
    /// Whether moving from `self` to `next` is allowed.
    pub fn can_transition_to(self, next: ProofState) -> bool {
        use ProofState::*;
        matches!(
            (self, next),
            (Unspent, Pending) | (Unspent, Spent) | (Pending, Spent) | (Pending, Unspent)
        )
    }
}

/// A bearer token: a secret plus the mint's unblinded signature on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    /// Keyset id. Empty for proofs from wallets that predate keysets.
    #[serde(default)]
    pub id: String,
    pub amount: u64,
    pub secret: String,
    #[serde(rename = "C")]
    pub c: PublicKey,
    #[serde(default)]
    pub script: Option<P2SHScript>,

    // Wallet-side bookkeeping. Never sent to the mint.
    #[serde(skip)]
    pub state: ProofState,
    #[serde(skip)]
    pub send_id: Option<Uuid>,
    #[serde(skip)]
    pub time_created: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub time_reserved: Option<DateTime<Utc>>,
}

impl Proof {
    pub fn new(id: impl Into<String>, amount: u64, secret: impl Into<String>, c: PublicKey) -> Self {
        Self {
            id: id.into(),
            amount,
            secret: secret.into(),
            c,
            script: None,
            state: ProofState::Unspent,
            send_id: None,
            time_created: Some(Utc::now()),
            time_reserved: None,
        }
    }

    /// Attach a P2SH script.
    pub fn with_script(mut self, script: P2SHScript) -> Self {
        self.script = Some(script);
        self
    }

    /// True if the secret follows the `P2SH:<address>:<nonce>` convention.
    pub fn is_locked(&self) -> bool {
        self.secret
            .split_once(':')
            .is_some_and(|(prefix, _)| prefix == P2SH_SECRET_PREFIX)
    }

    /// The address a locked secret commits to, if any.
    pub fn locked_address(&self) -> Option<&str> {
        let mut parts = self.secret.split(':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(P2SH_SECRET_PREFIX), Some(address), Some(_)) => Some(address),
            _ => None,
        }
    }

    /// Mark the proof reserved for an outgoing send.
    pub fn reserve(&mut self, send_id: Uuid) {
        self.state = ProofState::Pending;
        self.send_id = Some(send_id);
        self.time_reserved = Some(Utc::now());
    }
}

/// Spent-registry entry. Append-only: once here, a secret is dead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpentProof {
    pub secret: String,
    pub amount: u64,
    pub c: PublicKey,
    pub keyset_id: String,
    pub spent_at: DateTime<Utc>,
}

impl From<&Proof> for SpentProof {
    fn from(proof: &Proof) -> Self {
        Self {
            secret: proof.secret.clone(),
            amount: proof.amount,
            c: proof.c,
            keyset_id: proof.id.clone(),
            spent_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Lightning records
// ---------------------------------------------------------------------------

/// A Lightning invoice the mint issued for a deposit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub amount: u64,
    pub payment_request: String,
    pub payment_hash: String,
    pub issued: bool,
    pub paid: bool,
    pub preimage: Option<String>,
    pub time_created: DateTime<Utc>,
    pub time_paid: Option<DateTime<Utc>>,
}

impl Invoice {
    pub fn new(
        amount: u64,
        payment_request: impl Into<String>,
        payment_hash: impl Into<String>,
    ) -> Self {
        Self {
            amount,
            payment_request: payment_request.into(),
            payment_hash: payment_hash.into(),
            issued: false,
            paid: false,
            preimage: None,
            time_created: Utc::now(),
            time_paid: None,
        }
    }
}

/// Outcome of an invoice lookup or an outgoing payment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub paid: bool,
    pub preimage: Option<String>,
}

impl Payment {
    pub fn paid(preimage: impl Into<String>) -> Self {
        Self {
            paid: true,
            preimage: Some(preimage.into()),
        }
    }

    pub fn unpaid() -> Self {
        Self::default()
    }
}
