//! # Ledger
//!
//! The mint itself: signs blinded outputs, checks proofs, and keeps the
//! registry of spent secrets that stops anyone spending a token twice.
//!
//! ## Locking
//!
//! | State                 | Guard                             |
//! |-----------------------|-----------------------------------|
//! | keysets               | `RwLock<HashMap<id, Arc<KeySet>>>` |
//! | spent + pending sets  | `Mutex<Registry>`                 |
//! | invoices being minted | `DashMap<payment_hash, ()>`       |
//!
//! `split` holds the registry mutex from the first spent check until the
//! spent entries are durable and mirrored, so two splits of the same proof
//! are strictly ordered and the second sees `AlreadySpent`. Nothing in that
//! window awaits.
//!
//! `melt` cannot hold the mutex across a Lightning payment. It marks its
//! proofs pending (in storage and in the mirror), drops the mutex, pays,
//! and then either spends or releases them. A pending proof is refused by
//! every other operation until that happens.
//!
//! Lock order is registry, then keysets. Never the other way round.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use bitcoin::secp256k1::PublicKey;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use tracing::{debug, info, warn};

use super::error::{MintError, MintResult};
use super::registry::Registry;
use crate::amount::{amount_split, checked_sum, is_valid_denomination};
use crate::config::{LedgerConfig, MINT_INVOICE_MEMO};
use crate::crypto::{bdhke, KeySet, KeySetError};
use crate::lightning::{fee_reserve, msat_to_sat_ceil, DecodedInvoice, LightningError, LightningProvider};
use crate::script;
use crate::storage::{InvoiceUpdate, KeySetFilter, MintStorage, StorageError};
use crate::types::{BlindedMessage, BlindedSignature, Invoice, Payment, Promise, Proof, ProofState, SpentProof};

pub struct Ledger {
    keysets: RwLock<HashMap<String, Arc<KeySet>>>,
    active_keyset_id: String,
    registry: Mutex<Registry>,
    minting: DashMap<String, ()>,
    storage: Arc<dyn MintStorage>,
    lightning: Option<Arc<dyn LightningProvider>>,
    config: LedgerConfig,
}

/// Holds a payment hash in the in-flight set until dropped.
struct MintGuard<'a> {
    in_flight: &'a DashMap<String, ()>,
    payment_hash: String,
}

impl<'a> MintGuard<'a> {
    fn acquire(in_flight: &'a DashMap<String, ()>, payment_hash: &str) -> MintResult<Self> {
        match in_flight.entry(payment_hash.to_string()) {
            Entry::Occupied(_) => return Err(MintError::MintInProgress(payment_hash.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(());
            }
        }
        Ok(Self {
            in_flight,
            payment_hash: payment_hash.to_string(),
        })
    }
}

impl Drop for MintGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.payment_hash);
    }
}

impl Ledger {
    /// Derive the active keyset, restore every keyset and the spent
    /// registry from `storage`.
    ///
    /// Persisted keysets on other derivation paths are re-derived and kept
    /// for verification but marked inactive. Ones the master secret no
    /// longer reproduces are skipped with a warning.
    pub fn new(
        master_secret: &str,
        derivation_path: &str,
        storage: Arc<dyn MintStorage>,
        config: LedgerConfig,
    ) -> MintResult<Self> {
        let mut keysets = HashMap::new();
        let mut active = KeySet::derive(master_secret, derivation_path)?
            .with_mint_url(config.mint_url.clone());

        for info in storage.get_keysets(&KeySetFilter::All)? {
            if info.id == active.id() {
                active = KeySet::from_info(master_secret, &info)?;
                continue;
            }
            match KeySet::from_info(master_secret, &info) {
                Ok(mut keyset) => {
                    if keyset.is_active() {
                        keyset.deactivate(Utc::now());
                        storage.store_keyset(&keyset.info())?;
                        info!(keyset_id = %keyset.id(), "keyset retired");
                    }
                    keysets.insert(keyset.id().to_string(), Arc::new(keyset));
                }
                Err(KeySetError::IdMismatch { stored, .. }) => {
                    warn!(keyset_id = %stored, "persisted keyset not derivable from master secret, skipping");
                }
                Err(e) => return Err(e.into()),
            }
        }

        if !active.is_active() {
            let mut info = active.info();
            info.active = true;
            info.valid_to = None;
            active = KeySet::from_info(master_secret, &info)?;
        }
        storage.store_keyset(&active.info())?;

        let active_keyset_id = active.id().to_string();
        info!(
            keyset_id = %active_keyset_id,
            derivation_path = %derivation_path,
            known_keysets = keysets.len() + 1,
            "active keyset loaded"
        );
        keysets.insert(active_keyset_id.clone(), Arc::new(active));

        let ledger = Self {
            keysets: RwLock::new(keysets),
            active_keyset_id,
            registry: Mutex::new(Registry::default()),
            minting: DashMap::new(),
            storage,
            lightning: None,
            config,
        };
        ledger.load()?;
        Ok(ledger)
    }

    /// Attach a Lightning backend. Without one, minting is free and
    /// melting is refused.
    pub fn with_lightning(mut self, lightning: Arc<dyn LightningProvider>) -> Self {
        self.lightning = Some(lightning);
        self
    }

    /// Reload the spent registry and pending locks from storage.
    pub fn load(&self) -> MintResult<()> {
        let spent = self.storage.get_used_proofs()?;
        let pending = self.storage.get_pending_proofs()?;
        if !pending.is_empty() {
            warn!(
                count = pending.len(),
                "pending proofs found from an interrupted melt; they stay locked"
            );
        }
        let spent_count = spent.len();
        *self.registry.lock() = Registry::new(
            spent.into_iter().map(|p| p.secret),
            pending.into_iter().map(|p| p.secret),
        );
        debug!(spent = spent_count, "spent registry loaded");
        Ok(())
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn lightning_enabled(&self) -> bool {
        self.lightning.is_some()
    }

    fn lightning(&self) -> MintResult<&Arc<dyn LightningProvider>> {
        self.lightning.as_ref().ok_or(MintError::LightningDisabled)
    }

    // -- Keys -----------------------------------------------------------------

    pub fn active_keyset(&self) -> Arc<KeySet> {
        // Inserted in `new` and never removed.
        self.keysets
            .read()
            .get(&self.active_keyset_id)
            .cloned()
            .unwrap_or_else(|| unreachable!("active keyset missing from map"))
    }

    pub fn keyset(&self, id: &str) -> MintResult<Arc<KeySet>> {
        self.keysets
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| MintError::KeySetNotFound(id.to_string()))
    }

    /// Ids of every known keyset, active one last.
    pub fn keyset_ids(&self) -> Vec<String> {
        let keysets = self.keysets.read();
        let mut ids: Vec<&Arc<KeySet>> = keysets.values().collect();
        ids.sort_by_key(|ks| (ks.is_active(), ks.info().first_seen));
        ids.into_iter().map(|ks| ks.id().to_string()).collect()
    }

    /// Public keys of `keyset_id`, or of the active keyset.
    pub fn public_keys(&self, keyset_id: Option<&str>) -> MintResult<BTreeMap<u64, PublicKey>> {
        let keyset = match keyset_id {
            Some(id) => self.keyset(id)?,
            None => self.active_keyset(),
        };
        Ok(keyset.public_keys().clone())
    }

    fn signing_keyset(&self, keyset_id: Option<&str>) -> MintResult<Arc<KeySet>> {
        let keyset = match keyset_id {
            Some(id) => self.keyset(id)?,
            None => self.active_keyset(),
        };
        if !keyset.is_active() {
            return Err(MintError::KeySetInactive(keyset.id().to_string()));
        }
        Ok(keyset)
    }

    // -- Mint -----------------------------------------------------------------

    /// Create an invoice the caller pays to fund a later [`Ledger::mint`].
    pub async fn request_mint(&self, amount: u64) -> MintResult<Invoice> {
        if amount == 0 {
            return Err(MintError::InvalidAmount("amount must be positive".into()));
        }
        if amount.checked_mul(1000).is_none() {
            return Err(MintError::InvalidAmount(format!(
                "{amount} sats does not fit in millisatoshis"
            )));
        }
        let invoice = match &self.lightning {
            Some(lightning) => lightning.create_invoice(amount, MINT_INVOICE_MEMO).await?,
            None => {
                let mut hash = [0u8; 32];
                rand::rngs::OsRng.fill_bytes(&mut hash);
                Invoice::new(amount, String::new(), hex::encode(hash))
            }
        };
        self.storage.store_lightning_invoice(&invoice)?;
        info!(amount, payment_hash = %invoice.payment_hash, "mint requested");
        Ok(invoice)
    }

    /// Sign `outputs` against a paid invoice.
    ///
    /// Either every output is signed and the invoice is marked issued, or
    /// nothing changes.
    pub async fn mint(
        &self,
        outputs: &[BlindedMessage],
        payment_hash: Option<&str>,
        keyset_id: Option<&str>,
    ) -> MintResult<Vec<BlindedSignature>> {
        let keyset = self.signing_keyset(keyset_id)?;
        if outputs.is_empty() {
            return Err(MintError::InvalidOutputs("0".into()));
        }
        let total = self.check_outputs(outputs)?;

        let mut guard = None;
        if let Some(lightning) = &self.lightning {
            let payment_hash = payment_hash
                .ok_or_else(|| MintError::InvoiceNotFound("no payment hash given".into()))?;
            guard = Some(MintGuard::acquire(&self.minting, payment_hash)?);
            self.check_invoice(lightning.as_ref(), payment_hash, total).await?;
        }

        let signatures = sign_outputs(&keyset, outputs)?;
        self.persist_promises(outputs, &signatures)?;

        if let Some(guard) = &guard {
            self.storage
                .update_lightning_invoice(&guard.payment_hash, &[InvoiceUpdate::Issued(true)])?;
        }
        info!(
            amount = total,
            outputs = outputs.len(),
            keyset_id = %keyset.id(),
            "tokens issued"
        );
        Ok(signatures)
    }

    async fn check_invoice(
        &self,
        lightning: &dyn LightningProvider,
        payment_hash: &str,
        requested: u64,
    ) -> MintResult<()> {
        let invoice = self
            .storage
            .get_lightning_invoice(payment_hash)?
            .ok_or_else(|| MintError::InvoiceNotFound(payment_hash.to_string()))?;
        if invoice.issued {
            return Err(MintError::InvoiceAlreadyIssued);
        }
        if requested > invoice.amount {
            return Err(MintError::InsufficientFunds {
                needed: requested,
                available: invoice.amount,
            });
        }
        if invoice.paid {
            return Ok(());
        }

        let status = lightning.invoice_status(payment_hash).await?;
        if !status.paid {
            return Err(MintError::InvoiceNotPaid);
        }
        let mut updates = vec![InvoiceUpdate::Paid(true), InvoiceUpdate::TimePaid(Utc::now())];
        if let Some(preimage) = status.preimage {
            updates.push(InvoiceUpdate::Preimage(preimage));
        }
        self.storage.update_lightning_invoice(payment_hash, &updates)?;
        debug!(payment_hash = %payment_hash, "invoice paid");
        Ok(())
    }

    // -- Split ----------------------------------------------------------------

    /// Exchange `proofs` for new signatures: `fst` worth `total - amount`,
    /// `snd` worth `amount`.
    ///
    /// `outputs` must be exactly `amount_split(total - amount)` followed by
    /// `amount_split(amount)`.
    pub fn split(
        &self,
        proofs: &[Proof],
        amount: u64,
        outputs: &[BlindedMessage],
        keyset_id: Option<&str>,
    ) -> MintResult<(Vec<BlindedSignature>, Vec<BlindedSignature>)> {
        let keyset = self.signing_keyset(keyset_id)?;
        let total = sum_proofs(proofs)?;
        if amount > total {
            return Err(MintError::InvalidAmount(format!(
                "split amount {amount} exceeds input total {total}"
            )));
        }
        checked_sum(outputs.iter().map(|o| o.amount))
            .ok_or_else(|| MintError::InvalidAmount("output total overflows".into()))?;
        self.check_inputs(proofs)?;
        self.check_outputs(outputs)?;

        let mut registry = self.registry.lock();
        self.verify_proofs(proofs, &keyset)?;
        for proof in proofs {
            match registry.state(&proof.secret) {
                ProofState::Unspent => {}
                ProofState::Spent => {
                    warn!(amount = proof.amount, "double spend rejected");
                    return Err(MintError::AlreadySpent(proof.secret.clone()));
                }
                ProofState::Pending => return Err(MintError::ProofsPending(proof.secret.clone())),
            }
        }

        let fst_amounts = amount_split(total - amount);
        let snd_amounts = amount_split(amount);
        let given: Vec<u64> = outputs.iter().map(|o| o.amount).collect();
        if given.len() != fst_amounts.len() + snd_amounts.len()
            || given[..fst_amounts.len()] != fst_amounts[..]
            || given[fst_amounts.len()..] != snd_amounts[..]
        {
            return Err(MintError::InvalidOutputs(amount.to_string()));
        }

        let signatures = sign_outputs(&keyset, outputs)?;
        let signed = checked_sum(signatures.iter().map(|s| s.amount)).unwrap_or(u64::MAX);
        if signed != total {
            return Err(MintError::UnbalancedSplit {
                inputs: total,
                outputs: signed,
            });
        }
        self.persist_promises(outputs, &signatures)?;
        self.invalidate(&mut registry, proofs)?;
        drop(registry);

        let mut fst = signatures;
        let snd = fst.split_off(fst_amounts.len());
        info!(
            total,
            amount,
            inputs = proofs.len(),
            outputs = outputs.len(),
            "split completed"
        );
        Ok((fst, snd))
    }

    // -- Melt -----------------------------------------------------------------

    /// Redeem `proofs` by paying `payment_request`.
    ///
    /// The proofs are spent only if the payment succeeds. A failed or
    /// errored payment releases them.
    pub async fn melt(
        &self,
        proofs: &[Proof],
        payment_request: &str,
        keyset_id: Option<&str>,
    ) -> MintResult<Payment> {
        let lightning = self.lightning()?.clone();
        let fallback = match keyset_id {
            Some(id) => self.keyset(id)?,
            None => self.active_keyset(),
        };
        let total = sum_proofs(proofs)?;
        self.check_inputs(proofs)?;
        self.verify_proofs(proofs, &fallback)?;

        let decoded = lightning.decode_invoice(payment_request).await?;
        let fee_msat = self.fee_reserve_msat(lightning.as_ref(), &decoded).await?;
        let needed = decoded
            .amount_sat()
            .checked_add(msat_to_sat_ceil(fee_msat))
            .ok_or_else(|| MintError::InvalidAmount("invoice amount plus fees overflows".into()))?;
        if total < needed {
            return Err(MintError::InsufficientFunds {
                needed,
                available: total,
            });
        }

        self.lock_pending(proofs)?;
        debug!(amount = decoded.amount_sat(), fee_msat, "paying invoice");
        let payment = lightning.pay(payment_request, fee_msat).await;

        match payment {
            Ok(payment) if payment.paid => {
                let mut registry = self.registry.lock();
                self.invalidate(&mut registry, proofs)?;
                drop(registry);
                self.clear_pending(proofs);
                info!(
                    amount = decoded.amount_sat(),
                    inputs = proofs.len(),
                    payment_hash = %decoded.payment_hash,
                    "melt paid"
                );
                Ok(payment)
            }
            Ok(payment) => {
                self.release_pending(proofs);
                info!(payment_hash = %decoded.payment_hash, "melt payment failed, proofs released");
                Ok(payment)
            }
            Err(e) => {
                self.release_pending(proofs);
                warn!(error = %e, "lightning error during melt, proofs released");
                Err(e.into())
            }
        }
    }

    /// Fee reserve in sats for paying `payment_request` from this mint.
    pub async fn check_fees(&self, payment_request: &str) -> MintResult<u64> {
        let lightning = self.lightning()?;
        let decoded = lightning.decode_invoice(payment_request).await?;
        let fee_msat = self.fee_reserve_msat(lightning.as_ref(), &decoded).await?;
        Ok(msat_to_sat_ceil(fee_msat))
    }

    /// An invoice our own node knows about is internal and routes for free.
    async fn fee_reserve_msat(
        &self,
        lightning: &dyn LightningProvider,
        decoded: &DecodedInvoice,
    ) -> MintResult<u64> {
        let internal = match lightning.invoice_status(&decoded.payment_hash).await {
            Ok(_) => true,
            Err(LightningError::InvoiceNotFound(_)) => false,
            Err(e) => return Err(e.into()),
        };
        Ok(fee_reserve(decoded.amount_msat, internal, &self.config))
    }

    fn lock_pending(&self, proofs: &[Proof]) -> MintResult<()> {
        let mut registry = self.registry.lock();
        for proof in proofs {
            match registry.state(&proof.secret) {
                ProofState::Unspent => {}
                ProofState::Spent => {
                    warn!(amount = proof.amount, "double spend rejected");
                    return Err(MintError::AlreadySpent(proof.secret.clone()));
                }
                ProofState::Pending => return Err(MintError::ProofsPending(proof.secret.clone())),
            }
        }
        for (stored, proof) in proofs.iter().enumerate() {
            if let Err(e) = self.storage.store_proof(proof) {
                for earlier in &proofs[..stored] {
                    if let Err(e) = self.storage.delete_proof(&earlier.secret) {
                        warn!(error = %e, "failed to roll back pending proof");
                    }
                }
                return Err(e.into());
            }
        }
        registry.mark_pending(proofs.iter().map(|p| p.secret.as_str()));
        Ok(())
    }

    fn release_pending(&self, proofs: &[Proof]) {
        self.registry
            .lock()
            .release(proofs.iter().map(|p| p.secret.as_str()));
        self.clear_pending(proofs);
    }

    fn clear_pending(&self, proofs: &[Proof]) {
        for proof in proofs {
            if let Err(e) = self.storage.delete_proof(&proof.secret) {
                warn!(error = %e, "failed to clear pending proof");
            }
        }
    }

    // -- Checks ---------------------------------------------------------------

    /// One entry per proof: false only if the secret has been spent.
    pub fn check_spendable(&self, proofs: &[Proof]) -> Vec<bool> {
        let registry = self.registry.lock();
        proofs.iter().map(|p| !registry.is_spent(&p.secret)).collect()
    }

    pub fn proof_states(&self, proofs: &[Proof]) -> Vec<ProofState> {
        let registry = self.registry.lock();
        proofs.iter().map(|p| registry.state(&p.secret)).collect()
    }

    /// Scripts, secret shape, and duplicates. No signature checks.
    fn check_inputs(&self, proofs: &[Proof]) -> MintResult<()> {
        for proof in proofs {
            verify_proof_script(proof)?;
        }
        for proof in proofs {
            if proof.secret.is_empty() {
                return Err(MintError::InvalidSecret("empty secret".into()));
            }
            if proof.secret.len() > self.config.max_secret_length {
                return Err(MintError::InvalidSecret(format!(
                    "secret longer than {} bytes",
                    self.config.max_secret_length
                )));
            }
        }
        let mut seen = HashSet::with_capacity(proofs.len());
        if !proofs.iter().all(|p| seen.insert(p.secret.as_str())) {
            return Err(MintError::DuplicateInput);
        }
        Ok(())
    }

    /// Denominations, duplicates, and outputs signed before. Returns the total.
    fn check_outputs(&self, outputs: &[BlindedMessage]) -> MintResult<u64> {
        if let Some(bad) = outputs.iter().find(|o| !is_valid_denomination(o.amount)) {
            return Err(MintError::InvalidAmount(format!(
                "{} is not a valid denomination",
                bad.amount
            )));
        }
        let mut seen = HashSet::with_capacity(outputs.len());
        if !outputs.iter().all(|o| seen.insert(o.b_)) {
            return Err(MintError::DuplicateOutput);
        }
        for output in outputs {
            if self.storage.get_promise(&output.b_)?.is_some() {
                return Err(MintError::DuplicateOutput);
            }
        }
        checked_sum(outputs.iter().map(|o| o.amount))
            .ok_or_else(|| MintError::InvalidAmount("output total overflows".into()))
    }

    /// BDHKE check of every proof. An empty proof id means `fallback`.
    fn verify_proofs(&self, proofs: &[Proof], fallback: &Arc<KeySet>) -> MintResult<()> {
        for proof in proofs {
            let keyset = if proof.id.is_empty() {
                Arc::clone(fallback)
            } else {
                self.keyset(&proof.id)?
            };
            let private_key = keyset.private_key(proof.amount).map_err(|_| {
                MintError::InvalidAmount(format!("{} is not a valid denomination", proof.amount))
            })?;
            if !bdhke::verify(proof.secret.as_bytes(), &proof.c, private_key)? {
                debug!(keyset_id = %keyset.id(), amount = proof.amount, "proof failed verification");
                return Err(MintError::UnverifiedProof);
            }
        }
        Ok(())
    }

    // -- Persistence ------------------------------------------------------------

    fn persist_promises(
        &self,
        outputs: &[BlindedMessage],
        signatures: &[BlindedSignature],
    ) -> MintResult<()> {
        for (output, signature) in outputs.iter().zip(signatures) {
            self.storage.store_promise(&Promise::new(output, signature))?;
        }
        Ok(())
    }

    /// Durable write first, mirror second. Caller holds the registry lock.
    fn invalidate(&self, registry: &mut Registry, proofs: &[Proof]) -> MintResult<()> {
        let spent: Vec<SpentProof> = proofs.iter().map(SpentProof::from).collect();
        match self.storage.store_used_proofs(&spent) {
            Ok(()) => {}
            Err(StorageError::Duplicate(secret)) => {
                warn!("double spend rejected by storage");
                return Err(MintError::AlreadySpent(secret));
            }
            Err(e) => return Err(e.into()),
        }
        registry.mark_spent(proofs.iter().map(|p| p.secret.as_str()));
        Ok(())
    }
}

fn sum_proofs(proofs: &[Proof]) -> MintResult<u64> {
    if proofs.is_empty() {
        return Err(MintError::InvalidAmount("no proofs provided".into()));
    }
    checked_sum(proofs.iter().map(|p| p.amount))
        .ok_or_else(|| MintError::InvalidAmount("input total overflows".into()))
}

fn sign_outputs(keyset: &KeySet, outputs: &[BlindedMessage]) -> MintResult<Vec<BlindedSignature>> {
    outputs
        .iter()
        .map(|output| -> MintResult<BlindedSignature> {
            let private_key = keyset.private_key(output.amount)?;
            Ok(BlindedSignature {
                amount: output.amount,
                c_: bdhke::sign(&output.b_, private_key)?,
                id: keyset.id().to_string(),
            })
        })
        .collect()
}

/// A locked secret needs a script that unlocks its address. An unlocked
/// secret may not carry one that unlocks something else.
fn verify_proof_script(proof: &Proof) -> MintResult<()> {
    let attachment = proof
        .script
        .as_ref()
        .filter(|s| !s.script.is_empty() && !s.signature.is_empty());
    let Some(attachment) = attachment else {
        if proof.is_locked() {
            return Err(MintError::ScriptVerificationFailed(
                "secret indicates a script but no script is present".into(),
            ));
        }
        return Ok(());
    };

    let address = script::verify_script(&attachment.script, &attachment.signature)
        .map_err(|e| MintError::ScriptVerificationFailed(e.to_string()))?;
    match proof.locked_address() {
        Some(locked) if locked == address.to_string() => Ok(()),
        _ => Err(MintError::ScriptVerificationFailed(format!(
            "script unlocks {address}, not the address in the secret"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::bdhke::{blind_message, unblind, SECP};
    use crate::lightning::FakeLightning;
    use crate::script::P2SHLock;
    use crate::crypto::KeySetInfo;
    use crate::storage::{MemoryStorage, MintDB, StorageResult};
    use bitcoin::secp256k1::SecretKey;

    // -- Helpers ------------------------------------------------------------

    const MASTER: &str = "test master secret";

    fn ledger() -> Ledger {
        Ledger::new(
            MASTER,
            "0/0/0/0",
            Arc::new(MemoryStorage::new()),
            LedgerConfig::default(),
        )
        .unwrap()
    }

    fn ledger_with_lightning(config: LedgerConfig) -> (Ledger, Arc<FakeLightning>) {
        let lightning = Arc::new(FakeLightning::new());
        let ledger = Ledger::new(MASTER, "0/0/0/0", Arc::new(MemoryStorage::new()), config)
            .unwrap()
            .with_lightning(lightning.clone());
        (ledger, lightning)
    }

    struct Pending {
        secret: String,
        r: SecretKey,
        message: BlindedMessage,
    }

    fn outputs_for(amounts: &[u64]) -> Vec<Pending> {
        amounts
            .iter()
            .map(|amount| {
                let secret = uuid::Uuid::new_v4().to_string();
                let (b_, r) = blind_message(secret.as_bytes(), None).unwrap();
                Pending {
                    secret,
                    r,
                    message: BlindedMessage { amount: *amount, b_ },
                }
            })
            .collect()
    }

    fn messages(pending: &[Pending]) -> Vec<BlindedMessage> {
        pending.iter().map(|p| p.message).collect()
    }

    fn unblind_all(ledger: &Ledger, pending: &[Pending], sigs: &[BlindedSignature]) -> Vec<Proof> {
        pending
            .iter()
            .zip(sigs)
            .map(|(p, sig)| {
                let keys = ledger.public_keys(Some(&sig.id)).unwrap();
                let c = unblind(&sig.c_, &p.r, &keys[&sig.amount]).unwrap();
                Proof::new(sig.id.clone(), sig.amount, p.secret.clone(), c)
            })
            .collect()
    }

    async fn mint_proofs(ledger: &Ledger, amount: u64) -> Vec<Proof> {
        let pending = outputs_for(&amount_split(amount));
        let sigs = ledger.mint(&messages(&pending), None, None).await.unwrap();
        unblind_all(ledger, &pending, &sigs)
    }

    // -- Keys -----------------------------------------------------------------

    #[test]
    fn keys_are_deterministic_across_restarts() {
        let storage: Arc<dyn MintStorage> = Arc::new(MemoryStorage::new());
        let a = Ledger::new(MASTER, "0/0/0/0", storage.clone(), LedgerConfig::default()).unwrap();
        let b = Ledger::new(MASTER, "0/0/0/0", storage, LedgerConfig::default()).unwrap();
        assert_eq!(a.active_keyset().id(), b.active_keyset().id());
        assert_eq!(a.public_keys(None).unwrap(), b.public_keys(None).unwrap());
        assert_eq!(a.keyset_ids().len(), 1);
    }

    #[test]
    fn new_derivation_path_retires_old_keyset() {
        let storage: Arc<dyn MintStorage> = Arc::new(MemoryStorage::new());
        let old = Ledger::new(MASTER, "0/0/0/0", storage.clone(), LedgerConfig::default()).unwrap();
        let old_id = old.active_keyset().id().to_string();

        let new = Ledger::new(MASTER, "0/0/0/1", storage, LedgerConfig::default()).unwrap();
        assert_ne!(new.active_keyset().id(), old_id);
        assert_eq!(new.keyset_ids().len(), 2);
        assert_eq!(new.keyset_ids().last().unwrap(), new.active_keyset().id());
        assert!(!new.keyset(&old_id).unwrap().is_active());
        assert!(matches!(
            new.signing_keyset(Some(&old_id)),
            Err(MintError::KeySetInactive(_))
        ));
    }

    #[test]
    fn unknown_keyset_is_not_found() {
        let ledger = ledger();
        assert!(matches!(
            ledger.public_keys(Some("nope")),
            Err(MintError::KeySetNotFound(_))
        ));
    }

    // -- Mint -----------------------------------------------------------------

    #[tokio::test]
    async fn mint_without_lightning_issues_requested_denominations() {
        let ledger = ledger();
        let proofs = mint_proofs(&ledger, 13).await;
        let amounts: Vec<u64> = proofs.iter().map(|p| p.amount).collect();
        assert_eq!(amounts, vec![1, 4, 8]);
        assert_eq!(ledger.check_spendable(&proofs), vec![true, true, true]);
    }

    #[tokio::test]
    async fn mint_rejects_invalid_outputs() {
        let ledger = ledger();
        let bad = outputs_for(&[3]);
        assert!(matches!(
            ledger.mint(&messages(&bad), None, None).await,
            Err(MintError::InvalidAmount(_))
        ));

        let one = outputs_for(&[2]);
        let dup = vec![one[0].message, one[0].message];
        assert!(matches!(
            ledger.mint(&dup, None, None).await,
            Err(MintError::DuplicateOutput)
        ));

        assert!(matches!(
            ledger.mint(&[], None, None).await,
            Err(MintError::InvalidOutputs(_))
        ));
    }

    #[tokio::test]
    async fn resubmitted_outputs_are_rejected() {
        let ledger = ledger();
        let pending = outputs_for(&[8]);
        ledger.mint(&messages(&pending), None, None).await.unwrap();
        assert!(matches!(
            ledger.mint(&messages(&pending), None, None).await,
            Err(MintError::DuplicateOutput)
        ));
    }

    #[tokio::test]
    async fn mint_requires_paid_invoice() {
        let (ledger, lightning) = ledger_with_lightning(LedgerConfig::default());
        let invoice = ledger.request_mint(13).await.unwrap();
        let pending = outputs_for(&[1, 4, 8]);

        let err = ledger
            .mint(&messages(&pending), Some(&invoice.payment_hash), None)
            .await
            .unwrap_err();
        assert!(matches!(err, MintError::InvoiceNotPaid));

        lightning.set_paid(&invoice.payment_hash);
        let sigs = ledger
            .mint(&messages(&pending), Some(&invoice.payment_hash), None)
            .await
            .unwrap();
        assert_eq!(sigs.len(), 3);

        let again = outputs_for(&[1]);
        let err = ledger
            .mint(&messages(&again), Some(&invoice.payment_hash), None)
            .await
            .unwrap_err();
        assert!(matches!(err, MintError::InvoiceAlreadyIssued));
    }

    #[tokio::test]
    async fn mint_cannot_exceed_invoice_amount() {
        let (ledger, lightning) = ledger_with_lightning(LedgerConfig::default());
        let invoice = ledger.request_mint(8).await.unwrap();
        lightning.set_paid(&invoice.payment_hash);

        let pending = outputs_for(&[8, 16]);
        let err = ledger
            .mint(&messages(&pending), Some(&invoice.payment_hash), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MintError::InsufficientFunds {
                needed: 24,
                available: 8
            }
        ));
    }

    #[tokio::test]
    async fn mint_unknown_invoice_is_not_found() {
        let (ledger, _) = ledger_with_lightning(LedgerConfig::default());
        let pending = outputs_for(&[1]);
        assert!(matches!(
            ledger.mint(&messages(&pending), Some("deadbeef"), None).await,
            Err(MintError::InvoiceNotFound(_))
        ));
        assert!(matches!(
            ledger.mint(&messages(&pending), None, None).await,
            Err(MintError::InvoiceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_mint_on_one_hash_is_refused() {
        let (ledger, _) = ledger_with_lightning(LedgerConfig::default());
        let _held = MintGuard::acquire(&ledger.minting, "hash").unwrap();
        let pending = outputs_for(&[1]);
        assert!(matches!(
            ledger.mint(&messages(&pending), Some("hash"), None).await,
            Err(MintError::MintInProgress(_))
        ));
    }

    #[test]
    fn mint_guard_releases_on_drop() {
        let in_flight = DashMap::new();
        {
            let _guard = MintGuard::acquire(&in_flight, "h").unwrap();
            assert!(MintGuard::acquire(&in_flight, "h").is_err());
        }
        assert!(MintGuard::acquire(&in_flight, "h").is_ok());
    }

    #[tokio::test]
    async fn request_mint_rejects_zero() {
        let ledger = ledger();
        assert!(matches!(
            ledger.request_mint(0).await,
            Err(MintError::InvalidAmount(_))
        ));
    }

    // -- Split ----------------------------------------------------------------

    #[tokio::test]
    async fn split_thirteen_into_eight_and_five() {
        let ledger = ledger();
        let proofs = mint_proofs(&ledger, 13).await;

        let pending = outputs_for(&[8, 1, 4]);
        let (fst, snd) = ledger.split(&proofs, 5, &messages(&pending), None).unwrap();
        assert_eq!(fst.iter().map(|s| s.amount).collect::<Vec<_>>(), vec![8]);
        assert_eq!(snd.iter().map(|s| s.amount).collect::<Vec<_>>(), vec![1, 4]);
        assert_eq!(ledger.check_spendable(&proofs), vec![false, false, false]);

        let new_proofs = unblind_all(&ledger, &pending, &[fst, snd].concat());
        assert_eq!(ledger.check_spendable(&new_proofs), vec![true, true, true]);
    }

    #[tokio::test]
    async fn split_twice_is_double_spend() {
        let ledger = ledger();
        let proofs = mint_proofs(&ledger, 4).await;
        ledger
            .split(&proofs, 4, &messages(&outputs_for(&[4])), None)
            .unwrap();
        let err = ledger
            .split(&proofs, 4, &messages(&outputs_for(&[4])), None)
            .unwrap_err();
        assert!(matches!(err, MintError::AlreadySpent(_)));
    }

    #[tokio::test]
    async fn split_rejects_wrong_output_decomposition() {
        let ledger = ledger();
        let proofs = mint_proofs(&ledger, 13).await;
        // Right total, wrong order.
        let err = ledger
            .split(&proofs, 5, &messages(&outputs_for(&[1, 4, 8])), None)
            .unwrap_err();
        assert!(matches!(err, MintError::InvalidOutputs(_)));
        // Nothing was spent.
        assert_eq!(ledger.check_spendable(&proofs), vec![true, true, true]);
    }

    #[tokio::test]
    async fn split_amount_above_total_is_invalid() {
        let ledger = ledger();
        let proofs = mint_proofs(&ledger, 2).await;
        assert!(matches!(
            ledger.split(&proofs, 3, &messages(&outputs_for(&[1, 2])), None),
            Err(MintError::InvalidAmount(_))
        ));
    }

    #[tokio::test]
    async fn split_rejects_duplicate_inputs() {
        let ledger = ledger();
        let proofs = mint_proofs(&ledger, 2).await;
        let doubled = vec![proofs[0].clone(), proofs[0].clone()];
        assert!(matches!(
            ledger.split(&doubled, 4, &messages(&outputs_for(&[4])), None),
            Err(MintError::DuplicateInput)
        ));
    }

    #[tokio::test]
    async fn split_rejects_forged_proof() {
        let ledger = ledger();
        let mut proofs = mint_proofs(&ledger, 2).await;
        proofs[0].secret = "forged".into();
        assert!(matches!(
            ledger.split(&proofs, 2, &messages(&outputs_for(&[2])), None),
            Err(MintError::UnverifiedProof)
        ));
    }

    #[tokio::test]
    async fn split_rejects_unknown_keyset_before_state() {
        let ledger = ledger();
        let mut proofs = mint_proofs(&ledger, 2).await;
        proofs[0].id = "unknownkeys1".into();
        assert!(matches!(
            ledger.split(&proofs, 2, &messages(&outputs_for(&[2])), None),
            Err(MintError::KeySetNotFound(_))
        ));
    }

    #[tokio::test]
    async fn proof_without_keyset_id_uses_call_keyset() {
        let ledger = ledger();
        let mut proofs = mint_proofs(&ledger, 2).await;
        proofs[0].id.clear();
        assert!(ledger
            .split(&proofs, 2, &messages(&outputs_for(&[2])), None)
            .is_ok());
    }

    #[tokio::test]
    async fn split_rejects_oversized_secret() {
        let ledger = ledger();
        let mut proofs = mint_proofs(&ledger, 1).await;
        proofs[0].secret = "x".repeat(ledger.config().max_secret_length + 1);
        assert!(matches!(
            ledger.split(&proofs, 1, &messages(&outputs_for(&[1])), None),
            Err(MintError::InvalidSecret(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_splits_spend_once() {
        let ledger = Arc::new(ledger());
        let proofs = mint_proofs(&ledger, 8).await;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                let proofs = proofs.clone();
                std::thread::spawn(move || {
                    ledger
                        .split(&proofs, 8, &messages(&outputs_for(&[8])), None)
                        .is_ok()
                })
            })
            .collect();
        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(successes, 1);
    }

    #[tokio::test]
    async fn spent_registry_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let proofs = {
            let storage = Arc::new(MintDB::open(dir.path()).unwrap());
            let ledger = Ledger::new(MASTER, "0/0/0/0", storage, LedgerConfig::default()).unwrap();
            let proofs = mint_proofs(&ledger, 4).await;
            ledger
                .split(&proofs, 0, &messages(&outputs_for(&[4])), None)
                .unwrap();
            proofs
        };
        let storage = Arc::new(MintDB::open(dir.path()).unwrap());
        let ledger = Ledger::new(MASTER, "0/0/0/0", storage, LedgerConfig::default()).unwrap();
        assert_eq!(ledger.check_spendable(&proofs), vec![false]);
    }

    // -- Scripts ----------------------------------------------------------------

    #[tokio::test]
    async fn locked_proof_requires_matching_script() {
        let ledger = ledger();
        let owner = SecretKey::from_slice(&[7u8; 32]).unwrap();
        let lock = P2SHLock::to_public_key(&owner.public_key(&SECP)).unwrap();

        let secret = lock.secret("nonce");
        let (b_, r) = blind_message(secret.as_bytes(), None).unwrap();
        let sigs = ledger
            .mint(&[BlindedMessage { amount: 4, b_ }], None, None)
            .await
            .unwrap();
        let keys = ledger.public_keys(None).unwrap();
        let c = unblind(&sigs[0].c_, &r, &keys[&4]).unwrap();
        let bare = Proof::new(sigs[0].id.clone(), 4, secret, c);

        let err = ledger
            .split(&[bare.clone()], 4, &messages(&outputs_for(&[4])), None)
            .unwrap_err();
        assert!(matches!(err, MintError::ScriptVerificationFailed(_)));

        let intruder = SecretKey::from_slice(&[8u8; 32]).unwrap();
        let other_lock = P2SHLock::to_public_key(&intruder.public_key(&SECP)).unwrap();
        let wrong = bare.clone().with_script(other_lock.unlock(&intruder).unwrap());
        let err = ledger
            .split(&[wrong], 4, &messages(&outputs_for(&[4])), None)
            .unwrap_err();
        assert!(matches!(err, MintError::ScriptVerificationFailed(_)));

        let unlocked = bare.with_script(lock.unlock(&owner).unwrap());
        assert!(ledger
            .split(&[unlocked], 4, &messages(&outputs_for(&[4])), None)
            .is_ok());
    }

    // -- Melt -----------------------------------------------------------------

    fn melt_config() -> LedgerConfig {
        LedgerConfig {
            fee_percent: 1.0,
            fee_reserve_min_msat: 1_000,
            ..LedgerConfig::default()
        }
    }

    async fn funded(ledger: &Ledger, lightning: &FakeLightning, amount: u64) -> Vec<Proof> {
        let invoice = ledger.request_mint(amount).await.unwrap();
        lightning.set_paid(&invoice.payment_hash);
        let pending = outputs_for(&amount_split(amount));
        let sigs = ledger
            .mint(&messages(&pending), Some(&invoice.payment_hash), None)
            .await
            .unwrap();
        unblind_all(ledger, &pending, &sigs)
    }

    #[tokio::test]
    async fn melt_pays_and_invalidates() {
        let (ledger, lightning) = ledger_with_lightning(melt_config());
        let proofs = funded(&ledger, &lightning, 100).await;
        let pr = lightning.external_invoice(90_000);

        assert_eq!(ledger.check_fees(&pr).await.unwrap(), 1);
        let payment = ledger.melt(&proofs, &pr, None).await.unwrap();
        assert!(payment.paid);
        assert!(ledger.check_spendable(&proofs).iter().all(|s| !s));
        assert_eq!(lightning.outgoing_payments()[0].fee_limit_msat, 1_000);
    }

    #[tokio::test]
    async fn failed_payment_leaves_proofs_spendable() {
        let (ledger, lightning) = ledger_with_lightning(melt_config());
        let proofs = funded(&ledger, &lightning, 100).await;
        lightning.fail_payments(true);

        let payment = ledger
            .melt(&proofs, &lightning.external_invoice(90_000), None)
            .await
            .unwrap();
        assert!(!payment.paid);
        assert!(ledger.check_spendable(&proofs).iter().all(|s| *s));
        assert!(ledger
            .proof_states(&proofs)
            .iter()
            .all(|s| *s == ProofState::Unspent));
        assert!(ledger.storage.get_pending_proofs().unwrap().is_empty());
    }

    #[tokio::test]
    async fn melt_needs_fee_reserve() {
        let (ledger, lightning) = ledger_with_lightning(melt_config());
        let proofs = funded(&ledger, &lightning, 90).await;
        let err = ledger
            .melt(&proofs, &lightning.external_invoice(90_000), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MintError::InsufficientFunds {
                needed: 91,
                available: 90
            }
        ));
    }

    #[tokio::test]
    async fn internal_invoice_has_no_fee() {
        let (ledger, lightning) = ledger_with_lightning(melt_config());
        let proofs = funded(&ledger, &lightning, 8).await;
        let internal = ledger.request_mint(8).await.unwrap();
        assert_eq!(ledger.check_fees(&internal.payment_request).await.unwrap(), 0);
        assert!(ledger
            .melt(&proofs, &internal.payment_request, None)
            .await
            .unwrap()
            .paid);
    }

    #[tokio::test]
    async fn pending_proofs_are_refused() {
        let (ledger, lightning) = ledger_with_lightning(melt_config());
        let proofs = funded(&ledger, &lightning, 4).await;
        ledger.lock_pending(&proofs).unwrap();

        assert_eq!(ledger.proof_states(&proofs), vec![ProofState::Pending]);
        assert_eq!(ledger.check_spendable(&proofs), vec![true]);
        assert!(matches!(
            ledger.split(&proofs, 4, &messages(&outputs_for(&[4])), None),
            Err(MintError::ProofsPending(_))
        ));
        assert!(matches!(
            ledger
                .melt(&proofs, &lightning.external_invoice(1_000), None)
                .await,
            Err(MintError::ProofsPending(_))
        ));
    }

    #[tokio::test]
    async fn request_mint_rejects_amounts_beyond_msat_range() {
        let (ledger, _lightning) = ledger_with_lightning(melt_config());
        assert!(matches!(
            ledger.request_mint(u64::MAX / 10).await,
            Err(MintError::InvalidAmount(_))
        ));
        assert!(matches!(
            self::ledger().request_mint(u64::MAX).await,
            Err(MintError::InvalidAmount(_))
        ));
    }

    #[tokio::test]
    async fn huge_invoice_fees_do_not_overflow() {
        let (ledger, lightning) = ledger_with_lightning(melt_config());
        let proofs = funded(&ledger, &lightning, 8).await;
        let pr = format!("lnfake{}1{}", u64::MAX, "00".repeat(32));

        let fee = ledger.check_fees(&pr).await.unwrap();
        assert!(fee > 0);

        assert!(matches!(
            ledger.melt(&proofs, &pr, None).await,
            Err(MintError::InsufficientFunds { available: 8, .. })
        ));
        assert_eq!(ledger.proof_states(&proofs), vec![ProofState::Unspent]);
    }

    #[tokio::test]
    async fn fee_reserve_uses_exact_msat_amount() {
        let config = LedgerConfig {
            fee_percent: 1.0,
            fee_reserve_min_msat: 0,
            ..LedgerConfig::default()
        };
        let (ledger, lightning) = ledger_with_lightning(config);
        // 1% of 100_001 msat is 1_000 msat; rounding the invoice up to
        // 101 sats first would give 1_010.
        let pr = lightning.external_invoice(100_001);
        assert_eq!(ledger.check_fees(&pr).await.unwrap(), 1);
        let decoded = lightning.decode_invoice(&pr).await.unwrap();
        assert_eq!(
            ledger
                .fee_reserve_msat(lightning.as_ref(), &decoded)
                .await
                .unwrap(),
            1_000
        );
    }

    /// Memory storage whose `store_proof` starts failing after `limit` calls.
    struct FlakyStorage {
        inner: MemoryStorage,
        limit: usize,
        stored: std::sync::atomic::AtomicUsize,
    }

    impl MintStorage for FlakyStorage {
        fn get_used_proofs(&self) -> StorageResult<Vec<SpentProof>> {
            self.inner.get_used_proofs()
        }
        fn store_used_proofs(&self, proofs: &[SpentProof]) -> StorageResult<()> {
            self.inner.store_used_proofs(proofs)
        }
        fn store_proof(&self, proof: &Proof) -> StorageResult<()> {
            let n = self.stored.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n >= self.limit {
                return Err(StorageError::Serialization("disk full".into()));
            }
            self.inner.store_proof(proof)
        }
        fn delete_proof(&self, secret: &str) -> StorageResult<()> {
            self.inner.delete_proof(secret)
        }
        fn get_pending_proofs(&self) -> StorageResult<Vec<Proof>> {
            self.inner.get_pending_proofs()
        }
        fn store_promise(&self, promise: &Promise) -> StorageResult<()> {
            self.inner.store_promise(promise)
        }
        fn get_promise(&self, b_: &PublicKey) -> StorageResult<Option<Promise>> {
            self.inner.get_promise(b_)
        }
        fn get_keysets(
            &self,
            filter: &KeySetFilter,
        ) -> StorageResult<Vec<KeySetInfo>> {
            self.inner.get_keysets(filter)
        }
        fn store_keyset(&self, info: &KeySetInfo) -> StorageResult<()> {
            self.inner.store_keyset(info)
        }
        fn get_lightning_invoice(&self, payment_hash: &str) -> StorageResult<Option<Invoice>> {
            self.inner.get_lightning_invoice(payment_hash)
        }
        fn store_lightning_invoice(&self, invoice: &Invoice) -> StorageResult<()> {
            self.inner.store_lightning_invoice(invoice)
        }
        fn update_lightning_invoice(
            &self,
            payment_hash: &str,
            updates: &[InvoiceUpdate],
        ) -> StorageResult<Invoice> {
            self.inner.update_lightning_invoice(payment_hash, updates)
        }
    }

    #[tokio::test]
    async fn failed_pending_write_rolls_back_earlier_locks() {
        let storage = Arc::new(FlakyStorage {
            inner: MemoryStorage::new(),
            limit: 2,
            stored: std::sync::atomic::AtomicUsize::new(0),
        });
        let ledger = Ledger::new(MASTER, "0/0/0/0", storage.clone(), LedgerConfig::default()).unwrap();
        let proofs = mint_proofs(&ledger, 7).await;
        assert_eq!(proofs.len(), 3);

        assert!(matches!(
            ledger.lock_pending(&proofs),
            Err(MintError::Storage(_))
        ));
        assert!(storage.get_pending_proofs().unwrap().is_empty());
        assert!(ledger
            .proof_states(&proofs)
            .iter()
            .all(|s| *s == ProofState::Unspent));
    }

    #[tokio::test]
    async fn melt_without_lightning_is_disabled() {
        let ledger = ledger();
        let proofs = mint_proofs(&ledger, 4).await;
        assert!(matches!(
            ledger.melt(&proofs, "lnfake", None).await,
            Err(MintError::LightningDisabled)
        ));
        assert!(matches!(
            ledger.check_fees("lnfake").await,
            Err(MintError::LightningDisabled)
        ));
    }
}
