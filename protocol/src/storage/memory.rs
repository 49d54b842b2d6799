//! In-memory [`MintStorage`]. Forgets everything on drop; meant for tests
//! and throwaway dev mints.

use std::collections::HashMap;

use bitcoin::secp256k1::PublicKey;
use parking_lot::RwLock;

use super::{InvoiceUpdate, KeySetFilter, MintStorage, StorageError, StorageResult};
use crate::crypto::KeySetInfo;
use crate::types::{Invoice, Promise, Proof, SpentProof};

#[derive(Debug, Default)]
struct Tables {
    used_proofs: HashMap<String, SpentProof>,
    pending_proofs: HashMap<String, Proof>,
    promises: HashMap<PublicKey, Promise>,
    keysets: HashMap<String, KeySetInfo>,
    invoices: HashMap<String, Invoice>,
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    tables: RwLock<Tables>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MintStorage for MemoryStorage {
    fn get_used_proofs(&self) -> StorageResult<Vec<SpentProof>> {
        Ok(self.tables.read().used_proofs.values().cloned().collect())
    }

    fn store_used_proofs(&self, proofs: &[SpentProof]) -> StorageResult<()> {
        let mut tables = self.tables.write();
        let mut seen = std::collections::HashSet::new();
        for proof in proofs {
            if tables.used_proofs.contains_key(&proof.secret) || !seen.insert(&proof.secret) {
                return Err(StorageError::Duplicate(proof.secret.clone()));
            }
        }
        for proof in proofs {
            tables.used_proofs.insert(proof.secret.clone(), proof.clone());
        }
        Ok(())
    }

    fn store_proof(&self, proof: &Proof) -> StorageResult<()> {
        self.tables
            .write()
            .pending_proofs
            .insert(proof.secret.clone(), proof.clone());
        Ok(())
    }

    fn delete_proof(&self, secret: &str) -> StorageResult<()> {
        self.tables.write().pending_proofs.remove(secret);
        Ok(())
    }

    fn get_pending_proofs(&self) -> StorageResult<Vec<Proof>> {
        Ok(self.tables.read().pending_proofs.values().cloned().collect())
    }

    fn store_promise(&self, promise: &Promise) -> StorageResult<()> {
        self.tables.write().promises.insert(promise.b_, promise.clone());
        Ok(())
    }

    fn get_promise(&self, b_: &PublicKey) -> StorageResult<Option<Promise>> {
        Ok(self.tables.read().promises.get(b_).cloned())
    }

    fn get_keysets(&self, filter: &KeySetFilter) -> StorageResult<Vec<KeySetInfo>> {
        let tables = self.tables.read();
        let mut keysets: Vec<KeySetInfo> = tables
            .keysets
            .values()
            .filter(|info| filter.matches(info))
            .cloned()
            .collect();
        keysets.sort_by(|a, b| a.first_seen.cmp(&b.first_seen).then(a.id.cmp(&b.id)));
        Ok(keysets)
    }

    fn store_keyset(&self, info: &KeySetInfo) -> StorageResult<()> {
        self.tables.write().keysets.insert(info.id.clone(), info.clone());
        Ok(())
    }

    fn get_lightning_invoice(&self, payment_hash: &str) -> StorageResult<Option<Invoice>> {
        Ok(self.tables.read().invoices.get(payment_hash).cloned())
    }

    fn store_lightning_invoice(&self, invoice: &Invoice) -> StorageResult<()> {
        self.tables
            .write()
            .invoices
            .insert(invoice.payment_hash.clone(), invoice.clone());
        Ok(())
    }

    fn update_lightning_invoice(
        &self,
        payment_hash: &str,
        updates: &[InvoiceUpdate],
    ) -> StorageResult<Invoice> {
        let mut tables = self.tables.write();
        let invoice = tables
            .invoices
            .get_mut(payment_hash)
            .ok_or_else(|| StorageError::NotFound(payment_hash.to_string()))?;
        for update in updates {
            update.apply(invoice);
        }
        Ok(invoice.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::bdhke::hash_to_curve;

    fn spent(secret: &str) -> SpentProof {
        SpentProof::from(&Proof::new("id", 1, secret, hash_to_curve(secret.as_bytes()).unwrap()))
    }

    #[test]
    fn used_proofs_reject_duplicates_atomically() {
        let store = MemoryStorage::new();
        store.store_used_proofs(&[spent("a")]).unwrap();

        let err = store.store_used_proofs(&[spent("b"), spent("a")]).unwrap_err();
        assert!(matches!(err, StorageError::Duplicate(s) if s == "a"));
        // "b" must not have been written.
        assert_eq!(store.get_used_proofs().unwrap().len(), 1);

        let err = store.store_used_proofs(&[spent("c"), spent("c")]).unwrap_err();
        assert!(matches!(err, StorageError::Duplicate(_)));
        assert_eq!(store.get_used_proofs().unwrap().len(), 1);
    }

    #[test]
    fn pending_proofs_store_and_delete() {
        let store = MemoryStorage::new();
        let proof = Proof::new("id", 2, "pending", hash_to_curve(b"pending").unwrap());
        store.store_proof(&proof).unwrap();
        assert_eq!(store.get_pending_proofs().unwrap(), vec![proof]);
        store.delete_proof("pending").unwrap();
        assert!(store.get_pending_proofs().unwrap().is_empty());
    }

    #[test]
    fn update_missing_invoice_is_not_found() {
        let store = MemoryStorage::new();
        let err = store
            .update_lightning_invoice("nope", &[InvoiceUpdate::Paid(true)])
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[test]
    fn invoice_update_round_trip() {
        let store = MemoryStorage::new();
        store
            .store_lightning_invoice(&Invoice::new(64, "lnfake", "h1"))
            .unwrap();
        let updated = store
            .update_lightning_invoice("h1", &[InvoiceUpdate::Issued(true)])
            .unwrap();
        assert!(updated.issued);
        assert!(store.get_lightning_invoice("h1").unwrap().unwrap().issued);
    }
}
