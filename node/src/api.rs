//! # Mint HTTP API
//!
//! Builds the axum router for the mint. Every handler is a thin shim over a
//! [`Ledger`] operation; all the rules live in the ledger.
//!
//! ## Endpoints
//!
//! | Method | Path         | Description                               |
//! |--------|--------------|-------------------------------------------|
//! | GET    | `/health`    | Liveness probe                            |
//! | GET    | `/keys`      | Public keys of the active keyset          |
//! | GET    | `/keys/:id`  | Public keys of a keyset (url-safe id)     |
//! | GET    | `/keysets`   | Every keyset id the mint knows            |
//! | GET    | `/mint`      | Request an invoice to mint `?amount=`     |
//! | POST   | `/mint`      | Sign outputs against a paid invoice       |
//! | POST   | `/split`     | Swap proofs for new denominations         |
//! | POST   | `/melt`      | Redeem proofs by paying an invoice        |
//! | POST   | `/check`     | Spendability of proofs                    |
//! | POST   | `/checkfees` | Fee reserve for paying an invoice         |
//!
//! Errors come back as `{"error": "...", "code": <status>}`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, Query, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use ecash_protocol::crypto::{PaymentHashSealer, SealError};
use ecash_protocol::lightning::LightningError;
use ecash_protocol::mint::{Ledger, MintError};
use ecash_protocol::secp256k1::PublicKey;
use ecash_protocol::types::{BlindedMessage, BlindedSignature, Proof};

use crate::metrics::SharedMetrics;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<Ledger>,
    /// Present when payment hashes are handed out sealed.
    pub sealer: Option<Arc<PaymentHashSealer>>,
    pub metrics: SharedMetrics,
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/keys", get(keys_handler))
        .route("/keys/:id", get(keyset_keys_handler))
        .route("/keysets", get(keysets_handler))
        .route("/mint", get(request_mint_handler).post(mint_handler))
        .route("/split", post(split_handler))
        .route("/melt", post(melt_handler))
        .route("/check", post(check_handler))
        .route("/checkfees", post(check_fees_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / Response Types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct KeySetsResponse {
    pub keysets: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct RequestMintQuery {
    pub amount: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RequestMintResponse {
    pub pr: String,
    pub hash: String,
}

/// Older wallets send `?hash=`, newer ones `?payment_hash=`.
#[derive(Debug, Default, Deserialize)]
pub struct MintQuery {
    pub payment_hash: Option<String>,
    pub hash: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MintRequest {
    pub outputs: Vec<BlindedMessage>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MintResponse {
    pub promises: Vec<BlindedSignature>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SplitRequest {
    pub proofs: Vec<Proof>,
    pub amount: u64,
    pub outputs: Vec<BlindedMessage>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SplitResponse {
    pub fst: Vec<BlindedSignature>,
    pub snd: Vec<BlindedSignature>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MeltRequest {
    pub proofs: Vec<Proof>,
    pub pr: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MeltResponse {
    pub paid: bool,
    pub preimage: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckRequest {
    pub proofs: Vec<Proof>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckResponse {
    pub spendable: Vec<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckFeesRequest {
    pub pr: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckFeesResponse {
    pub fee: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ApiError {
    Mint(MintError),
    /// A payment hash that did not open under this mint's sealing key.
    Seal(SealError),
    MissingPaymentHash,
}

impl From<MintError> for ApiError {
    fn from(e: MintError) -> Self {
        ApiError::Mint(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Mint(e) => mint_error_status(e),
            ApiError::Seal(SealError::SealFailed) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Seal(_) | ApiError::MissingPaymentHash => StatusCode::BAD_REQUEST,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Mint(e) => e.to_string(),
            ApiError::Seal(e) => e.to_string(),
            ApiError::MissingPaymentHash => "payment hash required".into(),
        }
    }
}

fn mint_error_status(error: &MintError) -> StatusCode {
    match error {
        MintError::KeySetNotFound(_) | MintError::InvoiceNotFound(_) => StatusCode::NOT_FOUND,
        MintError::MintInProgress(_) | MintError::ProofsPending(_) => StatusCode::CONFLICT,
        MintError::Lightning(LightningError::Decode(_)) => StatusCode::BAD_REQUEST,
        MintError::Lightning(_) => StatusCode::BAD_GATEWAY,
        MintError::Storage(_) | MintError::KeySet(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.message(), status = status.as_u16(), "request failed");
        } else {
            tracing::debug!(error = %self.message(), status = status.as_u16(), "request rejected");
        }
        let body = ErrorResponse {
            error: self.message(),
            code: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Record latency for `endpoint`, and count the request if it was refused.
fn observe<T>(
    metrics: &SharedMetrics,
    endpoint: &str,
    started: Instant,
    result: Result<T, ApiError>,
) -> ApiResult<T> {
    metrics
        .request_latency_seconds
        .with_label_values(&[endpoint])
        .observe(started.elapsed().as_secs_f64());
    if result.is_err() {
        metrics
            .rejected_requests_total
            .with_label_values(&[endpoint])
            .inc();
    }
    result.map(Json)
}

/// Keyset ids are standard base64; in a URL path they arrive url-safe.
fn keyset_id_from_path(id: &str) -> String {
    id.replace('-', "+").replace('_', "/")
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health`
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

/// `GET /keys`
async fn keys_handler(
    State(state): State<AppState>,
) -> ApiResult<BTreeMap<u64, PublicKey>> {
    Ok(Json(state.ledger.public_keys(None)?))
}

/// `GET /keys/:id`
async fn keyset_keys_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<BTreeMap<u64, PublicKey>> {
    let id = keyset_id_from_path(&id);
    Ok(Json(state.ledger.public_keys(Some(&id))?))
}

/// `GET /keysets`
async fn keysets_handler(State(state): State<AppState>) -> Json<KeySetsResponse> {
    Json(KeySetsResponse {
        keysets: state.ledger.keyset_ids(),
    })
}

/// `GET /mint?amount=`
async fn request_mint_handler(
    Query(query): Query<RequestMintQuery>,
    State(state): State<AppState>,
) -> ApiResult<RequestMintResponse> {
    let started = Instant::now();
    let result = async {
        let invoice = state.ledger.request_mint(query.amount).await?;
        let hash = match &state.sealer {
            Some(sealer) => sealer.seal(&invoice.payment_hash).map_err(ApiError::Seal)?,
            None => invoice.payment_hash,
        };
        Ok::<_, ApiError>(RequestMintResponse {
            pr: invoice.payment_request,
            hash,
        })
    }
    .await;
    observe(&state.metrics, "request_mint", started, result)
}

/// `POST /mint?payment_hash=`
async fn mint_handler(
    Query(query): Query<MintQuery>,
    State(state): State<AppState>,
    Json(request): Json<MintRequest>,
) -> ApiResult<MintResponse> {
    let started = Instant::now();
    let result = async {
        let given = query.payment_hash.or(query.hash);
        let payment_hash = match (&state.sealer, given) {
            (Some(sealer), Some(sealed)) => Some(sealer.open(&sealed).map_err(ApiError::Seal)?),
            (Some(_), None) if state.ledger.lightning_enabled() => {
                return Err(ApiError::MissingPaymentHash)
            }
            (_, given) => given,
        };
        let promises = state
            .ledger
            .mint(&request.outputs, payment_hash.as_deref(), None)
            .await?;
        state
            .metrics
            .tokens_issued_total
            .inc_by(promises.iter().map(|p| p.amount).sum());
        Ok::<_, ApiError>(MintResponse { promises })
    }
    .await;
    observe(&state.metrics, "mint", started, result)
}

/// `POST /split`
async fn split_handler(
    State(state): State<AppState>,
    Json(request): Json<SplitRequest>,
) -> ApiResult<SplitResponse> {
    let started = Instant::now();
    let result = state
        .ledger
        .split(&request.proofs, request.amount, &request.outputs, None)
        .map(|(fst, snd)| {
            state.metrics.split_requests_total.inc();
            state
                .metrics
                .proofs_spent_total
                .inc_by(request.proofs.len() as u64);
            SplitResponse { fst, snd }
        })
        .map_err(ApiError::from);
    observe(&state.metrics, "split", started, result)
}

/// `POST /melt`
async fn melt_handler(
    State(state): State<AppState>,
    Json(request): Json<MeltRequest>,
) -> ApiResult<MeltResponse> {
    let started = Instant::now();
    state.metrics.melt_requests_total.inc();
    let result = state
        .ledger
        .melt(&request.proofs, &request.pr, None)
        .await
        .map(|payment| {
            if payment.paid {
                state
                    .metrics
                    .tokens_redeemed_total
                    .inc_by(request.proofs.iter().map(|p| p.amount).sum());
                state
                    .metrics
                    .proofs_spent_total
                    .inc_by(request.proofs.len() as u64);
            }
            MeltResponse {
                paid: payment.paid,
                preimage: payment.preimage,
            }
        })
        .map_err(ApiError::from);
    observe(&state.metrics, "melt", started, result)
}

/// `POST /check`
async fn check_handler(
    State(state): State<AppState>,
    Json(request): Json<CheckRequest>,
) -> Json<CheckResponse> {
    Json(CheckResponse {
        spendable: state.ledger.check_spendable(&request.proofs),
    })
}

/// `POST /checkfees`
async fn check_fees_handler(
    State(state): State<AppState>,
    Json(request): Json<CheckFeesRequest>,
) -> ApiResult<CheckFeesResponse> {
    let started = Instant::now();
    let result = state
        .ledger
        .check_fees(&request.pr)
        .await
        .map(|fee| CheckFeesResponse { fee })
        .map_err(ApiError::from);
    observe(&state.metrics, "checkfees", started, result)
}
