// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # ecash Mint Node
//!
//! Entry point for the `ecash-node` binary. Parses CLI arguments, sets up
//! logging, storage, Lightning and metrics, then serves the mint API.
//!
//! Subcommands:
//!
//! - `run`: start the mint
//! - `init`: create the data directory and a master key
//! - `version`: print build version information

mod api;
mod cli;
mod logging;
mod metrics;

use anyhow::{bail, Context, Result};
use clap::Parser;
use rand::RngCore;
use std::path::Path;
use std::sync::Arc;
use tokio::signal;

use ecash_protocol::crypto::{KeySet, PaymentHashSealer};
use ecash_protocol::lightning::{FakeLightning, LightningProvider, LnbitsClient};
use ecash_protocol::mint::Ledger;
use ecash_protocol::storage::MintDB;

use cli::{Commands, EcashNodeCli, LightningBackend};
use logging::LogFormat;
use metrics::MintMetrics;

/// File in the data directory holding the hex master secret.
const MASTER_KEY_FILE: &str = "mint.key";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = EcashNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_mint(args).await,
        Commands::Init(args) => init_mint(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Starts the mint: ledger, API server and metrics endpoint.
async fn run_mint(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(
        "ecash_node=info,ecash_protocol=info,tower_http=info",
        args.log_format,
    )?;

    tracing::info!(
        host = %args.host,
        port = args.port,
        metrics_port = args.metrics_port,
        data_dir = %args.data_dir.display(),
        lightning = ?args.lightning,
        "starting ecash-node"
    );

    // --- Persistent storage ---
    let db_path = args.data_dir.join("db");
    std::fs::create_dir_all(&db_path)
        .with_context(|| format!("failed to create database directory: {}", db_path.display()))?;
    let db = Arc::new(
        MintDB::open(&db_path)
            .with_context(|| format!("failed to open database at {}", db_path.display()))?,
    );
    tracing::info!(path = %db_path.display(), "database opened");

    // --- Ledger ---
    let master_secret = load_master_secret(args.private_key.as_deref(), &args.data_dir)?;
    let mut ledger = Ledger::new(
        &master_secret,
        &args.derivation_path,
        db.clone(),
        args.ledger_config(),
    )
    .context("failed to load ledger")?;

    if let Some(lightning) = lightning_backend(&args)? {
        ledger = ledger.with_lightning(lightning);
    }
    let ledger = Arc::new(ledger);
    tracing::info!(
        keyset_id = %ledger.active_keyset().id(),
        keysets = ledger.keyset_ids().len(),
        "ledger ready"
    );

    let sealer = args
        .seal_payment_hash
        .then(|| Arc::new(PaymentHashSealer::from_master_secret(&master_secret)));

    // --- Metrics ---
    let mint_metrics = Arc::new(MintMetrics::new().context("failed to register metrics")?);

    let app_state = api::AppState {
        ledger,
        sealer,
        metrics: Arc::clone(&mint_metrics),
    };

    // --- API server ---
    let api_router = api::create_router(app_state);
    let api_addr = format!("{}:{}", args.host, args.port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {}", api_addr))?;
    tracing::info!("mint API listening on {}", api_addr);

    // --- Metrics server ---
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(mint_metrics);
    let metrics_addr = format!("{}:{}", args.host, args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!("metrics server listening on {}", metrics_addr);

    // --- Serve ---
    tokio::select! {
        res = axum::serve(api_listener, api_router) => {
            if let Err(e) = res {
                tracing::error!("API server error: {}", e);
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!("metrics server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    db.flush().context("failed to flush database")?;
    tracing::info!("ecash-node stopped");
    Ok(())
}

/// The `--private-key` flag wins; otherwise `mint.key` in the data directory.
fn load_master_secret(flag: Option<&str>, data_dir: &Path) -> Result<String> {
    if let Some(secret) = flag.map(str::trim).filter(|s| !s.is_empty()) {
        return Ok(secret.to_string());
    }
    let key_path = data_dir.join(MASTER_KEY_FILE);
    if !key_path.exists() {
        bail!(
            "no master key: pass --private-key or run `ecash-node init -d {}`",
            data_dir.display()
        );
    }
    let secret = std::fs::read_to_string(&key_path)
        .with_context(|| format!("failed to read master key from {}", key_path.display()))?;
    let secret = secret.trim();
    if secret.is_empty() {
        bail!("master key file {} is empty", key_path.display());
    }
    Ok(secret.to_string())
}

fn lightning_backend(args: &cli::RunArgs) -> Result<Option<Arc<dyn LightningProvider>>> {
    let provider: Arc<dyn LightningProvider> = match args.lightning {
        LightningBackend::None => {
            tracing::warn!("lightning disabled: minting is free and melting is refused");
            return Ok(None);
        }
        LightningBackend::Fake => {
            tracing::warn!("using the fake lightning backend, every invoice settles instantly");
            Arc::new(FakeLightning::auto_settle())
        }
        LightningBackend::Lnbits => {
            let (Some(url), Some(key)) = (&args.lnbits_url, &args.lnbits_admin_key) else {
                bail!("--lightning lnbits needs --lnbits-url and --lnbits-admin-key");
            };
            let client = LnbitsClient::new(url.as_str(), key.as_str())
                .context("failed to build LNbits client")?;
            tracing::info!(url = %url, "using LNbits backend");
            Arc::new(client)
        }
    };
    Ok(Some(provider))
}

/// Creates the data directory and writes a fresh master key.
fn init_mint(args: cli::InitArgs) -> Result<()> {
    let data_dir = &args.data_dir;
    let key_path = data_dir.join(MASTER_KEY_FILE);
    if key_path.exists() {
        bail!(
            "{} already exists; refusing to overwrite a master key",
            key_path.display()
        );
    }

    logging::init_logging("ecash_node=info", LogFormat::Pretty)?;
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

    let mut secret = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut secret);
    let master_secret = hex::encode(secret);
    std::fs::write(&key_path, &master_secret)
        .with_context(|| format!("failed to write master key to {}", key_path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))?;
    }

    let keyset = KeySet::derive(&master_secret, &args.derivation_path)
        .context("failed to derive keyset")?;
    tracing::info!(key_path = %key_path.display(), keyset_id = %keyset.id(), "master key generated");

    println!("Mint initialized.");
    println!("  Data directory : {}", data_dir.display());
    println!("  Master key     : {}", key_path.display());
    println!("  Keyset         : {} ({})", keyset.id(), args.derivation_path);

    Ok(())
}

fn print_version() {
    println!("ecash-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol   {}", ecash_protocol::config::PROTOCOL_VERSION);
}

/// Waits for SIGINT or SIGTERM. A handler that fails to install just never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_overrides_key_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MASTER_KEY_FILE), "from-file\n").unwrap();
        assert_eq!(load_master_secret(Some("from-flag"), dir.path()).unwrap(), "from-flag");
        assert_eq!(load_master_secret(None, dir.path()).unwrap(), "from-file");
        assert_eq!(load_master_secret(Some("  "), dir.path()).unwrap(), "from-file");
    }

    #[test]
    fn missing_key_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_master_secret(None, dir.path()).unwrap_err();
        assert!(err.to_string().contains("ecash-node init"));
    }

    #[test]
    fn init_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let args = cli::InitArgs {
            data_dir: dir.path().join("mint"),
            derivation_path: "0/0/0/0".into(),
        };
        std::fs::create_dir_all(&args.data_dir).unwrap();
        std::fs::write(args.data_dir.join(MASTER_KEY_FILE), "existing").unwrap();
        let err = init_mint(args).unwrap_err();
        assert!(err.to_string().contains("refusing to overwrite"));
    }
}
