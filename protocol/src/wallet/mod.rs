//! # Wallet
//!
//! Everything a token holder does: blind secrets, unblind the mint's
//! answers, keep the resulting proofs, and split them to pay someone.
//!
//! - **outputs**: secret generation and the blind/unblind helpers.
//! - **connector**: [`MintConnector`], the wallet's view of a mint, and
//!   [`LocalMint`] which wires it straight to an in-process ledger.
//! - **client**: [`Wallet`], the stateful holder of proofs.

pub mod client;
pub mod connector;
pub mod error;
pub mod outputs;

pub use client::Wallet;
pub use connector::{LocalMint, MintConnector};
pub use error::{WalletError, WalletResult};
pub use outputs::{construct_outputs, construct_proofs, generate_locked_secret, generate_secret};
