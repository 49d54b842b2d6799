//! How a wallet reaches its mint.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::secp256k1::PublicKey;

use super::error::WalletResult;
use crate::mint::Ledger;
use crate::types::{BlindedMessage, BlindedSignature, Invoice, Payment, Proof};

/// The mint operations a wallet needs. Mirrors the HTTP API.
#[async_trait]
pub trait MintConnector: Send + Sync {
    /// Public keys of `keyset_id`, or of the active keyset.
    async fn keys(&self, keyset_id: Option<&str>) -> WalletResult<BTreeMap<u64, PublicKey>>;

    async fn keysets(&self) -> WalletResult<Vec<String>>;

    async fn request_mint(&self, amount: u64) -> WalletResult<Invoice>;

    async fn mint(
        &self,
        outputs: &[BlindedMessage],
        payment_hash: Option<&str>,
    ) -> WalletResult<Vec<BlindedSignature>>;

    async fn split(
        &self,
        proofs: &[Proof],
        amount: u64,
        outputs: &[BlindedMessage],
    ) -> WalletResult<(Vec<BlindedSignature>, Vec<BlindedSignature>)>;

    async fn melt(&self, proofs: &[Proof], payment_request: &str) -> WalletResult<Payment>;

    async fn check_spendable(&self, proofs: &[Proof]) -> WalletResult<Vec<bool>>;

    async fn check_fees(&self, payment_request: &str) -> WalletResult<u64>;
}

/// In-process connector straight onto a [`Ledger`].
#[derive(Clone)]
pub struct LocalMint {
    ledger: Arc<Ledger>,
}

impl LocalMint {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self { ledger }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }
}

#[async_trait]
impl MintConnector for LocalMint {
    async fn keys(&self, keyset_id: Option<&str>) -> WalletResult<BTreeMap<u64, PublicKey>> {
        Ok(self.ledger.public_keys(keyset_id)?)
    }

    async fn keysets(&self) -> WalletResult<Vec<String>> {
        Ok(self.ledger.keyset_ids())
    }

    async fn request_mint(&self, amount: u64) -> WalletResult<Invoice> {
        Ok(self.ledger.request_mint(amount).await?)
    }

    async fn mint(
        &self,
        outputs: &[BlindedMessage],
        payment_hash: Option<&str>,
    ) -> WalletResult<Vec<BlindedSignature>> {
        Ok(self.ledger.mint(outputs, payment_hash, None).await?)
    }

    async fn split(
        &self,
        proofs: &[Proof],
        amount: u64,
        outputs: &[BlindedMessage],
    ) -> WalletResult<(Vec<BlindedSignature>, Vec<BlindedSignature>)> {
        Ok(self.ledger.split(proofs, amount, outputs, None)?)
    }

    async fn melt(&self, proofs: &[Proof], payment_request: &str) -> WalletResult<Payment> {
        Ok(self.ledger.melt(proofs, payment_request, None).await?)
    }

    async fn check_spendable(&self, proofs: &[Proof]) -> WalletResult<Vec<bool>> {
        Ok(self.ledger.check_spendable(proofs))
    }

    async fn check_fees(&self, payment_request: &str) -> WalletResult<u64> {
        Ok(self.ledger.check_fees(payment_request).await?)
    }
}
