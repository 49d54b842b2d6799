//! LNbits REST backend.
//!
//! | Call            | Request                                         |
//! |-----------------|-------------------------------------------------|
//! | create invoice  | `POST /api/v1/payments {out: false, amount, memo}` |
//! | pay             | `POST /api/v1/payments {out: true, bolt11}`     |
//! | status          | `GET  /api/v1/payments/{hash}`                  |
//! | decode          | `POST /api/v1/payments/decode {data}`           |
//!
//! Every request carries the wallet's admin key in `X-Api-Key`. Error
//! bodies look like `{"detail": "..."}`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{DecodedInvoice, LightningError, LightningProvider, LightningResult};
use crate::types::{Invoice, Payment};

/// Payments can sit in flight for a long time; everything else is quick.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PAYMENT_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Serialize)]
struct CreateInvoiceRequest<'a> {
    out: bool,
    amount: u64,
    memo: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateInvoiceResponse {
    payment_hash: String,
    payment_request: String,
}

#[derive(Debug, Serialize)]
struct PayRequest<'a> {
    out: bool,
    bolt11: &'a str,
    #[serde(rename = "feeLimitMSat")]
    fee_limit_msat: u64,
}

#[derive(Debug, Deserialize)]
struct PayResponse {
    payment_hash: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    paid: bool,
    #[serde(default)]
    preimage: Option<String>,
}

#[derive(Debug, Serialize)]
struct DecodeRequest<'a> {
    data: &'a str,
}

#[derive(Debug, Deserialize)]
struct DecodeResponse {
    payment_hash: String,
    amount_msat: u64,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: String,
}

pub struct LnbitsClient {
    url: String,
    api_key: String,
    client: reqwest::Client,
}

impl LnbitsClient {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> LightningResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| LightningError::Http(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            url: url.into(),
            api_key: api_key.into(),
            client,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.url.trim_end_matches('/'), path)
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> LightningResult<T> {
        let response = request
            .header("X-Api-Key", &self.api_key)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| LightningError::Http(e.to_string()))?;
        handle_response(response).await
    }
}

async fn handle_response<T: DeserializeOwned>(response: reqwest::Response) -> LightningResult<T> {
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<ErrorBody>(&text)
            .map(|body| body.detail)
            .unwrap_or(text);
        return Err(LightningError::Status {
            code: status.as_u16(),
            detail,
        });
    }
    response
        .json::<T>()
        .await
        .map_err(|e| LightningError::InvalidResponse(e.to_string()))
}

#[async_trait]
impl LightningProvider for LnbitsClient {
    async fn create_invoice(&self, amount: u64, memo: &str) -> LightningResult<Invoice> {
        let body = CreateInvoiceRequest {
            out: false,
            amount,
            memo,
        };
        let created: CreateInvoiceResponse = self
            .send(self.client.post(self.endpoint("api/v1/payments")).json(&body))
            .await?;
        debug!(amount, payment_hash = %created.payment_hash, "lnbits invoice created");
        Ok(Invoice::new(amount, created.payment_request, created.payment_hash))
    }

    async fn invoice_status(&self, payment_hash: &str) -> LightningResult<Payment> {
        let path = format!("api/v1/payments/{payment_hash}");
        let status: LightningResult<StatusResponse> =
            self.send(self.client.get(self.endpoint(&path))).await;
        match status {
            Ok(status) => Ok(Payment {
                paid: status.paid,
                preimage: status.preimage.filter(|p| !p.is_empty()),
            }),
            Err(LightningError::Status { code, .. }) if code == StatusCode::NOT_FOUND.as_u16() => {
                Err(LightningError::InvoiceNotFound(payment_hash.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    async fn pay(&self, payment_request: &str, fee_limit_msat: u64) -> LightningResult<Payment> {
        let body = PayRequest {
            out: true,
            bolt11: payment_request,
            fee_limit_msat,
        };
        let request = self
            .client
            .post(self.endpoint("api/v1/payments"))
            .timeout(PAYMENT_TIMEOUT)
            .json(&body);
        let paid: PayResponse = match self.send(request).await {
            Ok(paid) => paid,
            Err(LightningError::Status { code, detail }) => {
                warn!(code, detail = %detail, "lnbits refused payment");
                return Ok(Payment::unpaid());
            }
            Err(e) => return Err(e),
        };
        self.invoice_status(&paid.payment_hash).await
    }

    async fn decode_invoice(&self, payment_request: &str) -> LightningResult<DecodedInvoice> {
        let body = DecodeRequest {
            data: payment_request,
        };
        let decoded: DecodeResponse = self
            .send(
                self.client
                    .post(self.endpoint("api/v1/payments/decode"))
                    .json(&body),
            )
            .await
            .map_err(|e| match e {
                LightningError::Status { detail, .. } => LightningError::Decode(detail),
                other => other,
            })?;
        Ok(DecodedInvoice {
            payment_hash: decoded.payment_hash,
            amount_msat: decoded.amount_msat,
            description: decoded.description,
        })
    }
}
