use thiserror::Error;

use crate::crypto::{BdhkeError, KeySetError};
use crate::lightning::LightningError;
use crate::storage::StorageError;

/// Everything a ledger operation can refuse with.
///
/// The first group is the client's fault and is safe to echo back over the
/// API. The transparent variants at the bottom are the mint's own failures.
#[derive(Debug, Error)]
pub enum MintError {
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("tokens already spent. Secret: {0}")]
    AlreadySpent(String),

    #[error("could not verify proofs")]
    UnverifiedProof,

    #[error("duplicate proofs")]
    DuplicateInput,

    #[error("duplicate promises")]
    DuplicateOutput,

    #[error("invoice not found: {0}")]
    InvoiceNotFound(String),

    #[error("lightning invoice not paid yet")]
    InvoiceNotPaid,

    #[error("tokens already issued for this invoice")]
    InvoiceAlreadyIssued,

    #[error("insufficient funds: need {needed}, have {available}")]
    InsufficientFunds { needed: u64, available: u64 },

    #[error("script verification failed: {0}")]
    ScriptVerificationFailed(String),

    #[error("unknown keyset: {0}")]
    KeySetNotFound(String),

    #[error("keyset {0} is inactive and cannot sign")]
    KeySetInactive(String),

    #[error("invalid secret: {0}")]
    InvalidSecret(String),

    #[error("split of {0} not possible with these outputs")]
    InvalidOutputs(String),

    #[error("proofs are pending: {0}")]
    ProofsPending(String),

    #[error("mint already in progress for payment hash {0}")]
    MintInProgress(String),

    #[error("lightning is disabled on this mint")]
    LightningDisabled,

    #[error("split is not balanced: inputs {inputs}, outputs {outputs}")]
    UnbalancedSplit { inputs: u64, outputs: u64 },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Lightning(#[from] LightningError),

    #[error(transparent)]
    Crypto(#[from] BdhkeError),

    #[error(transparent)]
    KeySet(#[from] KeySetError),
}

pub type MintResult<T> = Result<T, MintError>;
