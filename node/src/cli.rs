//! # CLI Interface
//!
//! Command-line arguments for `ecash-node`, via `clap` derive. Every `run`
//! flag can also come from an `ECASH_*` environment variable.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use ecash_protocol::config::{
    LedgerConfig, DEFAULT_API_PORT, DEFAULT_DERIVATION_PATH, DEFAULT_FEE_PERCENT,
    DEFAULT_FEE_RESERVE_MIN_MSAT, DEFAULT_METRICS_PORT, MAX_SECRET_LENGTH,
};

use crate::logging::LogFormat;

/// Chaumian ecash mint.
///
/// Issues blind-signed tokens against Lightning deposits, swaps them, and
/// redeems them by paying Lightning invoices.
#[derive(Parser, Debug)]
#[command(
    name = "ecash-node",
    about = "Chaumian ecash mint server",
    version,
    propagate_version = true
)]
pub struct EcashNodeCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the mint.
    Run(RunArgs),
    /// Create the data directory and generate a master key.
    Init(InitArgs),
    /// Print version information and exit.
    Version,
}

/// Where the mint gets its Lightning liquidity from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LightningBackend {
    /// No Lightning. Minting is free and melting is refused.
    None,
    /// In-process fake node that settles every invoice. Development only.
    Fake,
    /// An LNbits wallet over its REST API.
    Lnbits,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Address the API binds to.
    #[arg(long, env = "ECASH_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port for the mint API.
    #[arg(long, env = "ECASH_PORT", default_value_t = DEFAULT_API_PORT)]
    pub port: u16,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "ECASH_METRICS_PORT", default_value_t = DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,

    /// Directory holding the database and the master key file.
    #[arg(long, short = 'd', env = "ECASH_DATA_DIR", default_value = ".ecash")]
    pub data_dir: PathBuf,

    /// Master secret every keyset is derived from.
    ///
    /// When omitted, read from `mint.key` in the data directory.
    #[arg(long, env = "ECASH_PRIVATE_KEY", hide_env_values = true)]
    pub private_key: Option<String>,

    /// Derivation path of the active keyset. Changing it rotates keys.
    #[arg(long, env = "ECASH_DERIVATION_PATH", default_value = DEFAULT_DERIVATION_PATH)]
    pub derivation_path: String,

    /// Public URL of this mint, recorded on its keysets.
    ///
    /// Defaults to `http://<host>:<port>`.
    #[arg(long, env = "ECASH_MINT_URL")]
    pub mint_url: Option<String>,

    #[arg(long, env = "ECASH_LIGHTNING", value_enum, default_value_t = LightningBackend::None)]
    pub lightning: LightningBackend,

    /// LNbits base URL (required with `--lightning lnbits`).
    #[arg(long, env = "ECASH_LNBITS_URL")]
    pub lnbits_url: Option<String>,

    /// LNbits admin key (required with `--lightning lnbits`).
    #[arg(long, env = "ECASH_LNBITS_ADMIN_KEY", hide_env_values = true)]
    pub lnbits_admin_key: Option<String>,

    /// Lightning fee reserve as a percentage of the invoice amount.
    #[arg(long, env = "ECASH_FEE_PERCENT", default_value_t = DEFAULT_FEE_PERCENT)]
    pub fee_percent: f64,

    /// Minimum Lightning fee reserve in millisatoshis.
    #[arg(long, env = "ECASH_FEE_RESERVE_MIN_MSAT", default_value_t = DEFAULT_FEE_RESERVE_MIN_MSAT)]
    pub fee_reserve_min_msat: u64,

    /// Hand out encrypted payment hashes instead of the raw ones.
    #[arg(long, env = "ECASH_SEAL_PAYMENT_HASH")]
    pub seal_payment_hash: bool,

    #[arg(long, env = "ECASH_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

impl RunArgs {
    pub fn mint_url(&self) -> String {
        self.mint_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.host, self.port))
    }

    pub fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            mint_url: self.mint_url(),
            fee_percent: self.fee_percent,
            fee_reserve_min_msat: self.fee_reserve_min_msat,
            max_secret_length: MAX_SECRET_LENGTH,
        }
    }
}

#[derive(Parser, Debug)]
pub struct InitArgs {
    #[arg(long, short = 'd', env = "ECASH_DATA_DIR", default_value = ".ecash")]
    pub data_dir: PathBuf,

    /// Derivation path to preview the keyset id for.
    #[arg(long, default_value = DEFAULT_DERIVATION_PATH)]
    pub derivation_path: String,
}
