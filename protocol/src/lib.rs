// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # ecash: Core Library
//!
//! A Chaumian ecash mint and the wallet that talks to it. The mint signs
//! blinded secrets without ever seeing them, so when a token comes back it
//! can tell that it issued it, but not to whom.
//!
//! Blind signatures are BDHKE over secp256k1, the same curve as Bitcoin, so
//! the whole stack leans on libsecp256k1 through the `bitcoin` crate.
//!
//! ## Architecture
//!
//! - **crypto**: BDHKE, keyset derivation, hashing, payment-hash sealing.
//! - **amount**: the power-of-two denomination splitter.
//! - **types**: wire and storage records (proofs, promises, invoices).
//! - **script**: P2SH spending-condition verifier for locked tokens.
//! - **storage**: the `MintStorage` trait, in memory or on sled.
//! - **lightning**: the `LightningProvider` trait and its backends.
//! - **mint**: the ledger. Issues, splits, melts, and never double-spends.
//! - **wallet**: the client side. Blinds, unblinds, holds proofs.
//! - **config**: protocol constants and the ledger's runtime knobs.
//!
//! ## Ground rules
//!
//! 1. A spent secret stays spent. The registry is append-only.
//! 2. Nothing is signed unless everything is signed.
//! 3. No `unsafe`, no hand-rolled curve arithmetic.

pub mod amount;
pub mod config;
pub mod crypto;
pub mod lightning;
pub mod mint;
pub mod script;
pub mod storage;
pub mod types;
pub mod wallet;

pub use bitcoin::secp256k1;
