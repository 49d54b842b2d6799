//! # MintDB
//!
//! sled-backed [`MintStorage`]. One named tree per record kind, values
//! encoded with bincode:
//!
//! | Tree             | Key                        | Value                 |
//! |------------------|----------------------------|-----------------------|
//! | `used_proofs`    | secret (UTF-8)             | `bincode(SpentProof)` |
//! | `pending_proofs` | secret (UTF-8)             | `bincode(Proof)`      |
//! | `promises`       | `B_` (33 bytes compressed) | `bincode(Promise)`    |
//! | `keysets`        | keyset id (UTF-8)          | `bincode(KeySetInfo)` |
//! | `invoices`       | payment hash (UTF-8)       | `bincode(Invoice)`    |
//!
//! ## Atomicity
//!
//! Spent secrets are written in a single sled transaction that reads each
//! key first and aborts on the first one already present. Invoice updates
//! are a read-modify-write inside a transaction too, so two concurrent
//! updates to one invoice can't lose each other's fields.

use std::path::Path;

use bitcoin::secp256k1::PublicKey;
use serde::{de::DeserializeOwned, Serialize};
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult, TransactionError};
use sled::{Db, Tree};

use super::{InvoiceUpdate, KeySetFilter, MintStorage, StorageError, StorageResult};
use crate::crypto::KeySetInfo;
use crate::types::{Invoice, Promise, Proof, SpentProof};

#[derive(Debug, Clone)]
pub struct MintDB {
    db: Db,
    used_proofs: Tree,
    pending_proofs: Tree,
    promises: Tree,
    keysets: Tree,
    invoices: Tree,
}

impl MintDB {
    /// Open or create a database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// A database that lives in memory and vanishes on drop.
    pub fn open_temporary() -> StorageResult<Self> {
        let config = sled::Config::new().temporary(true);
        let db = config.open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> StorageResult<Self> {
        Ok(Self {
            used_proofs: db.open_tree("used_proofs")?,
            pending_proofs: db.open_tree("pending_proofs")?,
            promises: db.open_tree("promises")?,
            keysets: db.open_tree("keysets")?,
            invoices: db.open_tree("invoices")?,
            db,
        })
    }

    /// Block until every buffered write is on disk.
    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }

    pub fn used_proof_count(&self) -> usize {
        self.used_proofs.len()
    }

    pub fn promise_count(&self) -> usize {
        self.promises.len()
    }
}

fn encode<T: Serialize>(value: &T) -> StorageResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StorageResult<T> {
    bincode::deserialize(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn decode_all<T: DeserializeOwned>(tree: &Tree) -> StorageResult<Vec<T>> {
    tree.iter()
        .values()
        .map(|value| decode(&value?))
        .collect()
}

fn flatten(err: TransactionError<StorageError>) -> StorageError {
    match err {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => StorageError::Sled(e),
    }
}

impl MintStorage for MintDB {
    // -- Spent registry ---------------------------------------------------

    fn get_used_proofs(&self) -> StorageResult<Vec<SpentProof>> {
        decode_all(&self.used_proofs)
    }

    fn store_used_proofs(&self, proofs: &[SpentProof]) -> StorageResult<()> {
        let encoded = proofs
            .iter()
            .map(|p| encode(p).map(|bytes| (p.secret.as_str(), bytes)))
            .collect::<StorageResult<Vec<_>>>()?;

        self.used_proofs
            .transaction(|tx| -> ConflictableTransactionResult<(), StorageError> {
                for (secret, bytes) in &encoded {
                    if tx.get(secret.as_bytes())?.is_some() {
                        return Err(ConflictableTransactionError::Abort(StorageError::Duplicate(
                            secret.to_string(),
                        )));
                    }
                    tx.insert(secret.as_bytes(), bytes.as_slice())?;
                }
                Ok(())
            })
            .map_err(flatten)?;
        self.db.flush()?;
        Ok(())
    }

    // -- Pending ----------------------------------------------------------

    fn store_proof(&self, proof: &Proof) -> StorageResult<()> {
        self.pending_proofs.insert(proof.secret.as_bytes(), encode(proof)?)?;
        self.db.flush()?;
        Ok(())
    }

    fn delete_proof(&self, secret: &str) -> StorageResult<()> {
        self.pending_proofs.remove(secret.as_bytes())?;
        Ok(())
    }

    fn get_pending_proofs(&self) -> StorageResult<Vec<Proof>> {
        decode_all(&self.pending_proofs)
    }

    // -- Promises ---------------------------------------------------------

    fn store_promise(&self, promise: &Promise) -> StorageResult<()> {
        self.promises.insert(promise.b_.serialize(), encode(promise)?)?;
        Ok(())
    }

    fn get_promise(&self, b_: &PublicKey) -> StorageResult<Option<Promise>> {
        self.promises
            .get(b_.serialize())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    // -- Keysets ----------------------------------------------------------

    fn get_keysets(&self, filter: &KeySetFilter) -> StorageResult<Vec<KeySetInfo>> {
        if let KeySetFilter::Id(id) = filter {
            return self
                .keysets
                .get(id.as_bytes())?
                .map(|bytes| decode::<KeySetInfo>(&bytes))
                .transpose()
                .map(|found| found.into_iter().collect());
        }
        let mut keysets: Vec<KeySetInfo> = decode_all::<KeySetInfo>(&self.keysets)?
            .into_iter()
            .filter(|info| filter.matches(info))
            .collect();
        keysets.sort_by(|a, b| a.first_seen.cmp(&b.first_seen).then(a.id.cmp(&b.id)));
        Ok(keysets)
    }

    fn store_keyset(&self, info: &KeySetInfo) -> StorageResult<()> {
        self.keysets.insert(info.id.as_bytes(), encode(info)?)?;
        self.db.flush()?;
        Ok(())
    }

    // -- Lightning invoices -----------------------------------------------

    fn get_lightning_invoice(&self, payment_hash: &str) -> StorageResult<Option<Invoice>> {
        self.invoices
            .get(payment_hash.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    fn store_lightning_invoice(&self, invoice: &Invoice) -> StorageResult<()> {
        self.invoices
            .insert(invoice.payment_hash.as_bytes(), encode(invoice)?)?;
        Ok(())
    }

    fn update_lightning_invoice(
        &self,
        payment_hash: &str,
        updates: &[InvoiceUpdate],
    ) -> StorageResult<Invoice> {
        let abort = |e: StorageError| ConflictableTransactionError::Abort(e);
        let updated = self
            .invoices
            .transaction(|tx| -> ConflictableTransactionResult<Invoice, StorageError> {
                let bytes = tx
                    .get(payment_hash.as_bytes())?
                    .ok_or_else(|| abort(StorageError::NotFound(payment_hash.to_string())))?;
                let mut invoice: Invoice = decode(&bytes).map_err(abort)?;
                for update in updates {
                    update.apply(&mut invoice);
                }
                tx.insert(payment_hash.as_bytes(), encode(&invoice).map_err(abort)?)?;
                Ok(invoice)
            })
            .map_err(flatten)?;
        self.db.flush()?;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::bdhke::hash_to_curve;
    use crate::crypto::KeySet;
    use crate::types::{BlindedMessage, BlindedSignature};

    // -- Helpers ------------------------------------------------------------

    fn spent(secret: &str) -> SpentProof {
        SpentProof::from(&Proof::new(
            "id",
            4,
            secret,
            hash_to_curve(secret.as_bytes()).unwrap(),
        ))
    }

    fn promise(seed: &[u8]) -> Promise {
        let msg = BlindedMessage {
            amount: 8,
            b_: hash_to_curve(seed).unwrap(),
        };
        let sig = BlindedSignature {
            amount: 8,
            c_: hash_to_curve(b"signature").unwrap(),
            id: "keyset".into(),
        };
        Promise::new(&msg, &sig)
    }

    // -- Tests --------------------------------------------------------------

    #[test]
    fn open_temporary_database() {
        let db = MintDB::open_temporary().expect("should create temp db");
        assert_eq!(db.used_proof_count(), 0);
        assert!(db.get_pending_proofs().unwrap().is_empty());
        assert!(db.get_keysets(&KeySetFilter::All).unwrap().is_empty());
    }

    #[test]
    fn spent_registry_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let db = MintDB::open(dir.path()).expect("should open db");
            db.store_used_proofs(&[spent("a"), spent("b")]).unwrap();
        }
        let db = MintDB::open(dir.path()).expect("should reopen db");
        let mut secrets: Vec<String> = db
            .get_used_proofs()
            .unwrap()
            .into_iter()
            .map(|p| p.secret)
            .collect();
        secrets.sort();
        assert_eq!(secrets, vec!["a", "b"]);
    }

    #[test]
    fn duplicate_secret_aborts_whole_transaction() {
        let db = MintDB::open_temporary().unwrap();
        db.store_used_proofs(&[spent("a")]).unwrap();

        let err = db.store_used_proofs(&[spent("b"), spent("a")]).unwrap_err();
        assert!(matches!(err, StorageError::Duplicate(s) if s == "a"));
        assert_eq!(db.used_proof_count(), 1);
    }

    #[test]
    fn duplicate_within_one_call_is_rejected() {
        let db = MintDB::open_temporary().unwrap();
        let err = db.store_used_proofs(&[spent("x"), spent("x")]).unwrap_err();
        assert!(matches!(err, StorageError::Duplicate(_)));
        assert_eq!(db.used_proof_count(), 0);
    }

    #[test]
    fn pending_proof_keeps_script_attachment() {
        let db = MintDB::open_temporary().unwrap();
        let proof = Proof::new("id", 2, "locked", hash_to_curve(b"locked").unwrap()).with_script(
            crate::types::P2SHScript {
                script: "cmVkZWVt".into(),
                signature: "c2ln".into(),
                address: Some("3abc".into()),
            },
        );
        db.store_proof(&proof).unwrap();

        let pending = db.get_pending_proofs().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].script, proof.script);

        db.delete_proof("locked").unwrap();
        assert!(db.get_pending_proofs().unwrap().is_empty());
    }

    #[test]
    fn promise_lookup_by_blinded_point() {
        let db = MintDB::open_temporary().unwrap();
        let p = promise(b"first");
        db.store_promise(&p).unwrap();

        assert_eq!(db.get_promise(&p.b_).unwrap(), Some(p));
        assert!(db
            .get_promise(&hash_to_curve(b"second").unwrap())
            .unwrap()
            .is_none());
        assert_eq!(db.promise_count(), 1);
    }

    #[test]
    fn keyset_filters() {
        let db = MintDB::open_temporary().unwrap();
        let a = KeySet::derive("master", "0/0/0/0")
            .unwrap()
            .with_mint_url("http://a")
            .info();
        let b = KeySet::derive("master", "0/0/0/1")
            .unwrap()
            .with_mint_url("http://b")
            .info();
        db.store_keyset(&a).unwrap();
        db.store_keyset(&b).unwrap();

        assert_eq!(db.get_keysets(&KeySetFilter::All).unwrap().len(), 2);
        assert_eq!(
            db.get_keysets(&KeySetFilter::Id(a.id.clone())).unwrap(),
            vec![a.clone()]
        );
        assert_eq!(
            db.get_keysets(&KeySetFilter::MintUrl("http://b".into()))
                .unwrap(),
            vec![b]
        );
        assert!(db
            .get_keysets(&KeySetFilter::Id("missing".into()))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn invoice_lifecycle() {
        let db = MintDB::open_temporary().unwrap();
        db.store_lightning_invoice(&Invoice::new(21, "lnfake", "hash"))
            .unwrap();

        let paid = db
            .update_lightning_invoice(
                "hash",
                &[
                    InvoiceUpdate::Paid(true),
                    InvoiceUpdate::Preimage("beef".into()),
                ],
            )
            .unwrap();
        assert!(paid.paid);
        assert!(!paid.issued);

        db.update_lightning_invoice("hash", &[InvoiceUpdate::Issued(true)])
            .unwrap();
        let stored = db.get_lightning_invoice("hash").unwrap().unwrap();
        assert!(stored.paid && stored.issued);
        assert_eq!(stored.preimage.as_deref(), Some("beef"));
    }

    #[test]
    fn update_missing_invoice_is_not_found() {
        let db = MintDB::open_temporary().unwrap();
        let err = db
            .update_lightning_invoice("nope", &[InvoiceUpdate::Paid(true)])
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[test]
    fn concurrent_spends_of_one_secret_admit_exactly_one() {
        use std::sync::Arc;
        use std::thread;

        let db = Arc::new(MintDB::open_temporary().unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let db = Arc::clone(&db);
                thread::spawn(move || db.store_used_proofs(&[spent("contested")]).is_ok())
            })
            .collect();

        let successes = handles
            .into_iter()
            .map(|h| h.join().expect("writer thread should not panic"))
            .filter(|ok| *ok)
            .count();
        assert_eq!(successes, 1);
        assert_eq!(db.used_proof_count(), 1);
    }
}
