//! In-process Lightning backend.
//!
//! Payment requests look like `lnfake<amount_msat>1<payment_hash>` with a
//! 64 hex character hash, so the backend can decode anything it (or a test)
//! produced without a BOLT11 parser. Invoices are unpaid until a test calls
//! [`FakeLightning::set_paid`], unless the backend was built with
//! [`FakeLightning::auto_settle`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::RngCore;
use tracing::debug;

use super::{DecodedInvoice, LightningError, LightningProvider, LightningResult};
use crate::crypto::hash::sha256;
use crate::types::{Invoice, Payment};

const PREFIX: &str = "lnfake";
const HASH_HEX_LENGTH: usize = 64;

#[derive(Debug, Clone)]
struct FakeInvoice {
    preimage: String,
    paid: bool,
}

/// A payment the fake node was asked to make.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingPayment {
    pub payment_request: String,
    pub fee_limit_msat: u64,
    pub succeeded: bool,
}

#[derive(Debug, Default)]
pub struct FakeLightning {
    invoices: Mutex<HashMap<String, FakeInvoice>>,
    outgoing: Mutex<Vec<OutgoingPayment>>,
    auto_settle: bool,
    fail_payments: AtomicBool,
}

impl FakeLightning {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every invoice created is paid immediately. Handy for a dev mint.
    pub fn auto_settle() -> Self {
        Self {
            auto_settle: true,
            ..Self::default()
        }
    }

    /// Mark an invoice paid. Returns false if the hash is unknown.
    pub fn set_paid(&self, payment_hash: &str) -> bool {
        match self.invoices.lock().get_mut(payment_hash) {
            Some(invoice) => {
                invoice.paid = true;
                true
            }
            None => false,
        }
    }

    /// Make every subsequent outgoing payment fail (or succeed again).
    pub fn fail_payments(&self, fail: bool) {
        self.fail_payments.store(fail, Ordering::SeqCst);
    }

    /// A payment request for some other node. Decodable, unknown to
    /// [`LightningProvider::invoice_status`].
    pub fn external_invoice(&self, amount_msat: u64) -> String {
        let (_, payment_hash) = random_preimage();
        encode_payment_request(amount_msat, &payment_hash)
    }

    pub fn outgoing_payments(&self) -> Vec<OutgoingPayment> {
        self.outgoing.lock().clone()
    }
}

fn random_preimage() -> (String, String) {
    let mut preimage = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut preimage);
    (hex::encode(preimage), hex::encode(sha256(&preimage)))
}

fn encode_payment_request(amount_msat: u64, payment_hash: &str) -> String {
    format!("{PREFIX}{amount_msat}1{payment_hash}")
}

fn decode_payment_request(payment_request: &str) -> LightningResult<DecodedInvoice> {
    let invalid = || LightningError::Decode(payment_request.to_string());
    let body = payment_request.strip_prefix(PREFIX).ok_or_else(invalid)?;
    if body.len() < HASH_HEX_LENGTH + 2 || !body.is_ascii() {
        return Err(invalid());
    }
    let (head, payment_hash) = body.split_at(body.len() - HASH_HEX_LENGTH);
    let amount = head.strip_suffix('1').ok_or_else(invalid)?;
    let amount_msat = amount.parse::<u64>().map_err(|_| invalid())?;
    if hex::decode(payment_hash).is_err() {
        return Err(invalid());
    }
    Ok(DecodedInvoice {
        payment_hash: payment_hash.to_string(),
        amount_msat,
        description: None,
    })
}

#[async_trait]
impl LightningProvider for FakeLightning {
    async fn create_invoice(&self, amount: u64, _memo: &str) -> LightningResult<Invoice> {
        let amount_msat = amount
            .checked_mul(1000)
            .ok_or(LightningError::AmountOutOfRange(amount))?;
        let (preimage, payment_hash) = random_preimage();
        let payment_request = encode_payment_request(amount_msat, &payment_hash);
        self.invoices.lock().insert(
            payment_hash.clone(),
            FakeInvoice {
                preimage,
                paid: self.auto_settle,
            },
        );
        debug!(amount, payment_hash = %payment_hash, "fake invoice created");
        Ok(Invoice::new(amount, payment_request, payment_hash))
    }

    async fn invoice_status(&self, payment_hash: &str) -> LightningResult<Payment> {
        let invoices = self.invoices.lock();
        let invoice = invoices
            .get(payment_hash)
            .ok_or_else(|| LightningError::InvoiceNotFound(payment_hash.to_string()))?;
        Ok(if invoice.paid {
            Payment::paid(invoice.preimage.clone())
        } else {
            Payment::unpaid()
        })
    }

    async fn pay(&self, payment_request: &str, fee_limit_msat: u64) -> LightningResult<Payment> {
        let decoded = decode_payment_request(payment_request)?;
        let succeeded = !self.fail_payments.load(Ordering::SeqCst);
        self.outgoing.lock().push(OutgoingPayment {
            payment_request: payment_request.to_string(),
            fee_limit_msat,
            succeeded,
        });
        if !succeeded {
            return Ok(Payment::unpaid());
        }

        // Paying one of our own invoices settles it.
        if let Some(invoice) = self.invoices.lock().get_mut(&decoded.payment_hash) {
            invoice.paid = true;
            return Ok(Payment::paid(invoice.preimage.clone()));
        }
        let (preimage, _) = random_preimage();
        Ok(Payment::paid(preimage))
    }

    async fn decode_invoice(&self, payment_request: &str) -> LightningResult<DecodedInvoice> {
        decode_payment_request(payment_request)
    }
}
