//! # Prometheus Metrics
//!
//! Operational metrics for the mint, scraped at `/metrics` on the metrics
//! port. Everything lives in a dedicated registry under the `ecash`
//! namespace.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::core::Collector;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct MintMetrics {
    registry: Registry,
    /// Sum of amounts signed by `/mint`.
    pub tokens_issued_total: IntCounter,
    /// Sum of proof amounts redeemed by successful melts.
    pub tokens_redeemed_total: IntCounter,
    /// Proofs moved into the spent registry.
    pub proofs_spent_total: IntCounter,
    pub split_requests_total: IntCounter,
    pub melt_requests_total: IntCounter,
    /// Requests refused by the ledger, by endpoint.
    pub rejected_requests_total: IntCounterVec,
    pub request_latency_seconds: HistogramVec,
}

fn register<C: Collector + Clone + 'static>(registry: &Registry, metric: C) -> prometheus::Result<C> {
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

impl MintMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("ecash".into()), None)?;

        let tokens_issued_total = register(
            &registry,
            IntCounter::new("tokens_issued_total", "Total value of tokens issued")?,
        )?;
        let tokens_redeemed_total = register(
            &registry,
            IntCounter::new("tokens_redeemed_total", "Total value of tokens redeemed over Lightning")?,
        )?;
        let proofs_spent_total = register(
            &registry,
            IntCounter::new("proofs_spent_total", "Total number of proofs invalidated")?,
        )?;
        let split_requests_total = register(
            &registry,
            IntCounter::new("split_requests_total", "Total number of successful splits")?,
        )?;
        let melt_requests_total = register(
            &registry,
            IntCounter::new("melt_requests_total", "Total number of melt attempts")?,
        )?;
        let rejected_requests_total = register(
            &registry,
            IntCounterVec::new(
                Opts::new("rejected_requests_total", "Requests refused by the ledger"),
                &["endpoint"],
            )?,
        )?;
        let request_latency_seconds = register(
            &registry,
            HistogramVec::new(
                HistogramOpts::new("request_latency_seconds", "Ledger request latency in seconds")
                    .buckets(vec![
                        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 30.0,
                    ]),
                &["endpoint"],
            )?,
        )?;

        Ok(Self {
            registry,
            tokens_issued_total,
            tokens_redeemed_total,
            proofs_spent_total,
            split_requests_total,
            melt_requests_total,
            rejected_requests_total,
            request_latency_seconds,
        })
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn encode(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub type SharedMetrics = Arc<MintMetrics>;

/// `GET /metrics`
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
