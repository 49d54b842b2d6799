use std::collections::{BTreeMap, HashMap, HashSet};

use bitcoin::secp256k1::{PublicKey, SecretKey};
use tracing::{debug, info};
use uuid::Uuid;

use super::connector::MintConnector;
use super::error::{WalletError, WalletResult};
use super::outputs::{construct_outputs, construct_proofs, generate_locked_secret, generate_secret};
use crate::amount::amount_split;
use crate::crypto::derive_keyset_id;
use crate::types::{BlindedSignature, Invoice, Payment, Proof, ProofState};

/// Client side of the protocol: holds proofs, talks to one mint.
///
/// Proofs handed out by [`Wallet::send`] stay in the wallet, reserved, until
/// [`Wallet::invalidate`] sees the mint has spent them.
pub struct Wallet<C> {
    connector: C,
    keysets: HashMap<String, BTreeMap<u64, PublicKey>>,
    active_keyset: Option<String>,
    proofs: Vec<Proof>,
}

impl<C: MintConnector> Wallet<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            keysets: HashMap::new(),
            active_keyset: None,
            proofs: Vec::new(),
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn proofs(&self) -> &[Proof] {
        &self.proofs
    }

    pub fn active_keyset_id(&self) -> Option<&str> {
        self.active_keyset.as_deref()
    }

    /// Fetch the active keys and any keyset the mint lists that we have not
    /// seen. Each keyset's keys are checked against its id.
    pub async fn load_keys(&mut self) -> WalletResult<()> {
        let active = self.connector.keys(None).await?;
        let active_id = derive_keyset_id(&active);
        self.keysets.insert(active_id.clone(), active);

        for id in self.connector.keysets().await? {
            if self.keysets.contains_key(&id) {
                continue;
            }
            let keys = self.connector.keys(Some(&id)).await?;
            if derive_keyset_id(&keys) != id {
                return Err(WalletError::KeySetIdMismatch(id));
            }
            self.keysets.insert(id, keys);
        }
        debug!(keyset_id = %active_id, known = self.keysets.len(), "mint keys loaded");
        self.active_keyset = Some(active_id);
        Ok(())
    }

    fn keys_for(&self, keyset_id: &str) -> WalletResult<&BTreeMap<u64, PublicKey>> {
        if self.keysets.is_empty() {
            return Err(WalletError::KeysNotLoaded);
        }
        self.keysets
            .get(keyset_id)
            .ok_or_else(|| WalletError::UnknownKeySet(keyset_id.to_string()))
    }

    fn unblind(
        &self,
        promises: &[BlindedSignature],
        secrets: &[String],
        blinding_factors: &[SecretKey],
    ) -> WalletResult<Vec<Proof>> {
        let Some(first) = promises.first() else {
            return Ok(Vec::new());
        };
        let keys = self.keys_for(&first.id)?;
        construct_proofs(promises, secrets, blinding_factors, keys)
    }

    pub async fn request_mint(&self, amount: u64) -> WalletResult<Invoice> {
        self.connector.request_mint(amount).await
    }

    /// Mint `amount` against a paid invoice (or freely, if the mint has no
    /// Lightning backend).
    pub async fn mint(&mut self, amount: u64, payment_hash: Option<&str>) -> WalletResult<Vec<Proof>> {
        if self.active_keyset.is_none() {
            return Err(WalletError::KeysNotLoaded);
        }
        let amounts = amount_split(amount);
        let secrets: Vec<String> = amounts.iter().map(|_| generate_secret()).collect();
        let (outputs, blinding_factors) = construct_outputs(&amounts, &secrets)?;

        let promises = self.connector.mint(&outputs, payment_hash).await?;
        if promises.is_empty() {
            return Err(WalletError::EmptyResponse);
        }
        let proofs = self.unblind(&promises, &secrets, &blinding_factors)?;
        self.proofs.extend(proofs.iter().cloned());
        info!(amount, proofs = proofs.len(), "minted");
        Ok(proofs)
    }

    /// Swap `proofs` for a `keep` set worth `total - amount` and a `send` set
    /// worth `amount`. With `lock_to`, the send set is locked to that P2SH
    /// address.
    pub async fn split(
        &mut self,
        proofs: &[Proof],
        amount: u64,
        lock_to: Option<&str>,
    ) -> WalletResult<(Vec<Proof>, Vec<Proof>)> {
        let total: u64 = proofs.iter().map(|p| p.amount).sum();
        if amount > total {
            return Err(WalletError::InsufficientBalance {
                needed: amount,
                available: total,
            });
        }
        let keep_amounts = amount_split(total - amount);
        let send_amounts = amount_split(amount);

        let mut secrets: Vec<String> = keep_amounts.iter().map(|_| generate_secret()).collect();
        secrets.extend(send_amounts.iter().map(|_| match lock_to {
            Some(address) => generate_locked_secret(address),
            None => generate_secret(),
        }));
        let amounts = [keep_amounts, send_amounts].concat();
        let (outputs, blinding_factors) = construct_outputs(&amounts, &secrets)?;

        let (fst, snd) = self.connector.split(proofs, amount, &outputs).await?;
        if fst.len() + snd.len() != secrets.len() {
            return Err(WalletError::OutputMismatch {
                expected: secrets.len(),
                got: fst.len() + snd.len(),
            });
        }
        let (keep_secrets, send_secrets) = secrets.split_at(fst.len());
        let (keep_rs, send_rs) = blinding_factors.split_at(fst.len());
        let keep = self.unblind(&fst, keep_secrets, keep_rs)?;
        let send = self.unblind(&snd, send_secrets, send_rs)?;

        self.forget(proofs.iter().map(|p| p.secret.as_str()));
        self.proofs.extend(keep.iter().cloned());
        self.proofs.extend(send.iter().cloned());
        debug!(total, amount, "split");
        Ok((keep, send))
    }

    /// Carve out proofs worth exactly `amount` and reserve them.
    pub async fn send(&mut self, amount: u64) -> WalletResult<(Vec<Proof>, Vec<Proof>)> {
        let selected = self.select(amount)?;
        let (keep, send) = self.split(&selected, amount, None).await?;
        let send_id = Uuid::new_v4();
        let reserved: HashSet<&str> = send.iter().map(|p| p.secret.as_str()).collect();
        for proof in self.proofs.iter_mut().filter(|p| reserved.contains(p.secret.as_str())) {
            proof.reserve(send_id);
        }
        let send = self
            .proofs
            .iter()
            .filter(|p| p.send_id == Some(send_id))
            .cloned()
            .collect();
        Ok((keep, send))
    }

    /// Redeem someone else's proofs for fresh ones of our own.
    pub async fn receive(&mut self, proofs: &[Proof]) -> WalletResult<Vec<Proof>> {
        let total: u64 = proofs.iter().map(|p| p.amount).sum();
        let (_, received) = self.split(proofs, total, None).await?;
        info!(amount = total, "received");
        Ok(received)
    }

    /// Pay `payment_request`, worth `amount` sats, out of the wallet.
    ///
    /// Proofs covering the amount plus the mint's fee reserve are reserved
    /// first. They are dropped if the payment goes through and released
    /// otherwise.
    pub async fn melt(&mut self, payment_request: &str, amount: u64) -> WalletResult<Payment> {
        let fee = self.connector.check_fees(payment_request).await?;
        let (_, send) = self.send(amount + fee).await?;

        match self.connector.melt(&send, payment_request).await {
            Ok(payment) if payment.paid => {
                self.forget(send.iter().map(|p| p.secret.as_str()));
                info!(amount, fee, "melted");
                Ok(payment)
            }
            Ok(payment) => {
                self.unreserve(&send);
                Ok(payment)
            }
            Err(e) => {
                self.unreserve(&send);
                Err(e)
            }
        }
    }

    /// Drop every proof the mint reports as spent. An empty slice checks the
    /// whole wallet. Returns what was dropped.
    pub async fn invalidate(&mut self, proofs: &[Proof]) -> WalletResult<Vec<Proof>> {
        let candidates = if proofs.is_empty() {
            self.proofs.clone()
        } else {
            proofs.to_vec()
        };
        let spendable = self.connector.check_spendable(&candidates).await?;
        let spent: Vec<Proof> = candidates
            .into_iter()
            .zip(spendable)
            .filter_map(|(proof, ok)| (!ok).then_some(proof))
            .collect();
        self.forget(spent.iter().map(|p| p.secret.as_str()));
        Ok(spent)
    }

    pub fn balance(&self) -> u64 {
        self.proofs.iter().map(|p| p.amount).sum()
    }

    /// Balance excluding proofs reserved for an outgoing send.
    pub fn available_balance(&self) -> u64 {
        self.spendable().map(|p| p.amount).sum()
    }

    fn spendable(&self) -> impl Iterator<Item = &Proof> {
        let active = self.active_keyset.as_deref();
        self.proofs
            .iter()
            .filter(move |p| p.state == ProofState::Unspent && Some(p.id.as_str()) == active)
    }

    /// Largest-first selection of unreserved proofs covering `amount`.
    fn select(&self, amount: u64) -> WalletResult<Vec<Proof>> {
        let mut candidates: Vec<&Proof> = self.spendable().collect();
        candidates.sort_by(|a, b| b.amount.cmp(&a.amount));

        let mut selected = Vec::new();
        let mut sum = 0u64;
        for proof in candidates {
            if sum >= amount {
                break;
            }
            sum += proof.amount;
            selected.push(proof.clone());
        }
        if sum < amount || selected.is_empty() {
            return Err(WalletError::InsufficientBalance {
                needed: amount,
                available: self.available_balance(),
            });
        }
        Ok(selected)
    }

    fn forget<'a>(&mut self, secrets: impl IntoIterator<Item = &'a str>) {
        let secrets: HashSet<String> = secrets.into_iter().map(str::to_string).collect();
        self.proofs.retain(|p| !secrets.contains(&p.secret));
    }

    fn unreserve(&mut self, proofs: &[Proof]) {
        let secrets: HashSet<&str> = proofs.iter().map(|p| p.secret.as_str()).collect();
        for proof in self.proofs.iter_mut().filter(|p| secrets.contains(p.secret.as_str())) {
            proof.state = ProofState::Unspent;
            proof.send_id = None;
            proof.time_reserved = None;
        }
    }
}
