//! # Storage
//!
//! What the mint must remember across restarts, behind one trait so the
//! ledger never knows which backend it talks to.
//!
//! ```text
//! mod.rs     MintStorage contract, filters, invoice updates, errors
//! memory.rs  MemoryStorage: HashMaps behind a parking_lot RwLock
//! db.rs      MintDB: sled trees, bincode values
//! ```
//!
//! The contract is synchronous. Both backends answer from memory or sled's
//! page cache, and the ledger calls them while holding its registry lock,
//! where an `.await` would be wrong anyway.
//!
//! `store_used_proofs` is the one write with teeth: it is all-or-nothing,
//! and it refuses a secret that is already recorded. That is what makes the
//! spent registry authoritative even if two ledgers shared a database.

pub mod db;
pub mod memory;

use bitcoin::secp256k1::PublicKey;
use chrono::{DateTime, Utc};

use crate::crypto::KeySetInfo;
use crate::types::{Invoice, Promise, Proof, SpentProof};

pub use db::MintDB;
pub use memory::MemoryStorage;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate entry: {0}")]
    Duplicate(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Selects keysets in [`MintStorage::get_keysets`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySetFilter {
    All,
    Id(String),
    MintUrl(String),
}

impl KeySetFilter {
    pub fn matches(&self, info: &KeySetInfo) -> bool {
        match self {
            KeySetFilter::All => true,
            KeySetFilter::Id(id) => &info.id == id,
            KeySetFilter::MintUrl(url) => &info.mint_url == url,
        }
    }
}

/// A single field change applied by [`MintStorage::update_lightning_invoice`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvoiceUpdate {
    Paid(bool),
    Issued(bool),
    TimePaid(DateTime<Utc>),
    Preimage(String),
}

impl InvoiceUpdate {
    pub fn apply(&self, invoice: &mut Invoice) {
        match self {
            InvoiceUpdate::Paid(paid) => invoice.paid = *paid,
            InvoiceUpdate::Issued(issued) => invoice.issued = *issued,
            InvoiceUpdate::TimePaid(at) => invoice.time_paid = Some(*at),
            InvoiceUpdate::Preimage(preimage) => invoice.preimage = Some(preimage.clone()),
        }
    }
}

/// Durable state of a mint.
pub trait MintStorage: Send + Sync {
    // -- Spent registry ---------------------------------------------------

    fn get_used_proofs(&self) -> StorageResult<Vec<SpentProof>>;

    /// Record spent secrets. All or nothing; any secret already present
    /// (or repeated within `proofs`) fails the whole call with
    /// [`StorageError::Duplicate`].
    fn store_used_proofs(&self, proofs: &[SpentProof]) -> StorageResult<()>;

    // -- Pending (melt in flight) -----------------------------------------

    fn store_proof(&self, proof: &Proof) -> StorageResult<()>;
    fn delete_proof(&self, secret: &str) -> StorageResult<()>;
    fn get_pending_proofs(&self) -> StorageResult<Vec<Proof>>;

    // -- Promises ---------------------------------------------------------

    fn store_promise(&self, promise: &Promise) -> StorageResult<()>;
    fn get_promise(&self, b_: &PublicKey) -> StorageResult<Option<Promise>>;

    // -- Keysets ----------------------------------------------------------

    fn get_keysets(&self, filter: &KeySetFilter) -> StorageResult<Vec<KeySetInfo>>;
    fn store_keyset(&self, info: &KeySetInfo) -> StorageResult<()>;

    // -- Lightning invoices -----------------------------------------------

    fn get_lightning_invoice(&self, payment_hash: &str) -> StorageResult<Option<Invoice>>;
    fn store_lightning_invoice(&self, invoice: &Invoice) -> StorageResult<()>;

    /// Apply `updates` in order. [`StorageError::NotFound`] if the invoice
    /// does not exist.
    fn update_lightning_invoice(
        &self,
        payment_hash: &str,
        updates: &[InvoiceUpdate],
    ) -> StorageResult<Invoice>;
}
