//! # Protocol Configuration & Constants
//!
//! Every magic number the mint relies on lives here. Most of them are
//! baked into the wire protocol: change `MAX_ORDER` or the keyset id length
//! and every wallet in the wild stops recognizing your keys. Choose wisely.
//!
//! Runtime knobs (fees, secret limits, mint URL) are collected in
//! [`LedgerConfig`], which the node fills from its CLI flags.

// ---------------------------------------------------------------------------
// Keysets
// ---------------------------------------------------------------------------

/// Number of denominations per keyset. Denominations are `2^0 .. 2^(MAX_ORDER-1)`,
/// so the biggest single token is worth 2^63 sats. Nobody is minting that.
pub const MAX_ORDER: u32 = 64;

/// Length of a keyset identifier (characters of standard base64).
pub const KEYSET_ID_LENGTH: usize = 12;

/// Derivation path used when the operator doesn't pick one.
pub const DEFAULT_DERIVATION_PATH: &str = "0/0/0/0";

// ---------------------------------------------------------------------------
// Proof Secrets
// ---------------------------------------------------------------------------

/// Upper bound on the length of a proof secret, in bytes.
///
/// Secrets are hashed to the curve on every verification, and they land in
/// the spent registry forever. Unbounded secrets are a free storage DoS.
pub const MAX_SECRET_LENGTH: usize = 512;

/// Prefix marking a secret as locked to a P2SH script.
pub const P2SH_SECRET_PREFIX: &str = "P2SH";

// ---------------------------------------------------------------------------
// Lightning Fees
// ---------------------------------------------------------------------------

/// Default routing-fee reserve, as a percentage of the invoice amount.
pub const DEFAULT_FEE_PERCENT: f64 = 1.0;

/// Default minimum routing-fee reserve in millisatoshis.
pub const DEFAULT_FEE_RESERVE_MIN_MSAT: u64 = 2_000;

/// Memo attached to invoices created for mint requests.
pub const MINT_INVOICE_MEMO: &str = "ecash mint deposit";

// ---------------------------------------------------------------------------
// Node Defaults
// ---------------------------------------------------------------------------

/// Default HTTP port for the mint API.
pub const DEFAULT_API_PORT: u16 = 3338;

/// Default port for the Prometheus scrape endpoint.
pub const DEFAULT_METRICS_PORT: u16 = 3339;

/// Protocol version reported by the node.
pub const PROTOCOL_VERSION: &str = "0.1.0";

// ---------------------------------------------------------------------------
// LedgerConfig
// ---------------------------------------------------------------------------

/// Runtime parameters for a [`Ledger`](crate::mint::Ledger).
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerConfig {
    /// URL the mint is reachable at. Stored on every keyset it creates.
    pub mint_url: String,
    /// Routing-fee reserve as a percentage of the invoice amount.
    pub fee_percent: f64,
    /// Minimum routing-fee reserve in millisatoshis.
    pub fee_reserve_min_msat: u64,
    /// Maximum accepted secret length in bytes.
    pub max_secret_length: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            mint_url: format!("http://127.0.0.1:{DEFAULT_API_PORT}"),
            fee_percent: DEFAULT_FEE_PERCENT,
            fee_reserve_min_msat: DEFAULT_FEE_RESERVE_MIN_MSAT,
            max_secret_length: MAX_SECRET_LENGTH,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn largest_denomination_fits_in_u64() {
        assert_eq!(1u64.checked_shl(MAX_ORDER - 1), Some(1 << 63));
        assert_eq!(1u64.checked_shl(MAX_ORDER), None);
    }

    #[test]
    fn default_ledger_config_uses_constants() {
        let cfg = LedgerConfig::default();
        assert_eq!(cfg.fee_reserve_min_msat, DEFAULT_FEE_RESERVE_MIN_MSAT);
        assert_eq!(cfg.max_secret_length, MAX_SECRET_LENGTH);
        assert!(cfg.mint_url.ends_with("3338"));
    }
}
