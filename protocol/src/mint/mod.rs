//! # Mint
//!
//! The ledger and the bookkeeping around it.
//!
//! - **ledger**: issuance, split, melt, and spendability checks.
//! - **registry**: in-memory mirror of spent and pending secrets.
//! - **error**: [`MintError`], the single error type every ledger
//!   operation returns.

pub mod error;
pub mod ledger;
pub mod registry;

pub use error::{MintError, MintResult};
pub use ledger::Ledger;
pub use registry::Registry;
