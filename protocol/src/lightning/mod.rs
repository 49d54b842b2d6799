//! # Lightning
//!
//! The mint's only link to real money. Deposits arrive as paid invoices,
//! redemptions leave as payments, and the ledger talks to whatever node is
//! behind it through [`LightningProvider`].
//!
//! ```text
//! mod.rs     LightningProvider, DecodedInvoice, errors, fee reserve
//! fake.rs    FakeLightning: in-process, no network, scriptable by tests
//! lnbits.rs  LnbitsClient: LNbits REST API over reqwest (feature "lnbits")
//! ```
//!
//! ## Fee reserve
//!
//! A melt must carry enough extra value to cover routing. The reserve is
//! `max(fee_reserve_min_msat, amount_msat * fee_percent / 100)`, rounded up
//! to whole sats. Paying an invoice this mint issued itself never leaves
//! the node, so it costs nothing.

pub mod fake;
#[cfg(feature = "lnbits")]
pub mod lnbits;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::LedgerConfig;
use crate::types::{Invoice, Payment};

pub use fake::FakeLightning;
#[cfg(feature = "lnbits")]
pub use lnbits::LnbitsClient;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LightningError {
    /// The backend has no invoice with this payment hash.
    #[error("invoice not found: {0}")]
    InvoiceNotFound(String),

    #[error("could not decode payment request: {0}")]
    Decode(String),

    #[error("lightning backend unreachable: {0}")]
    Http(String),

    /// Non-2xx response from the backend, with its `detail` message.
    #[error("lightning backend returned {code}: {detail}")]
    Status { code: u16, detail: String },

    #[error("unexpected response from lightning backend: {0}")]
    InvalidResponse(String),

    #[error("amount of {0} sats is out of range")]
    AmountOutOfRange(u64),
}

pub type LightningResult<T> = Result<T, LightningError>;

/// The parts of a BOLT11 invoice the mint cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedInvoice {
    pub payment_hash: String,
    pub amount_msat: u64,
    pub description: Option<String>,
}

impl DecodedInvoice {
    /// Invoice amount in whole sats, rounded up.
    pub fn amount_sat(&self) -> u64 {
        msat_to_sat_ceil(self.amount_msat)
    }
}

/// A Lightning node as seen by the mint.
#[async_trait]
pub trait LightningProvider: Send + Sync {
    /// Create an invoice for `amount` sats.
    async fn create_invoice(&self, amount: u64, memo: &str) -> LightningResult<Invoice>;

    /// Whether an invoice this node issued has been paid.
    async fn invoice_status(&self, payment_hash: &str) -> LightningResult<Payment>;

    /// Pay `payment_request`, spending at most `fee_limit_msat` on routing.
    async fn pay(&self, payment_request: &str, fee_limit_msat: u64) -> LightningResult<Payment>;

    async fn decode_invoice(&self, payment_request: &str) -> LightningResult<DecodedInvoice>;
}

/// Routing-fee reserve in millisatoshis.
pub fn fee_reserve(amount_msat: u64, internal: bool, config: &LedgerConfig) -> u64 {
    if internal {
        return 0;
    }
    let proportional = (amount_msat as f64 * config.fee_percent / 100.0) as u64;
    proportional.max(config.fee_reserve_min_msat)
}

pub fn msat_to_sat_ceil(msat: u64) -> u64 {
    msat.div_ceil(1000)
}
