use thiserror::Error;

use crate::crypto::BdhkeError;
use crate::mint::MintError;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("insufficient balance: need {needed}, have {available}")]
    InsufficientBalance { needed: u64, available: u64 },

    #[error("mint keys not loaded")]
    KeysNotLoaded,

    #[error("no mint key for amount {0}")]
    MissingKey(u64),

    #[error("unknown keyset: {0}")]
    UnknownKeySet(String),

    #[error("mint public keys do not hash to keyset id {0}")]
    KeySetIdMismatch(String),

    #[error("expected {expected} outputs, got {got}")]
    OutputMismatch { expected: usize, got: usize },

    #[error("mint returned no signatures")]
    EmptyResponse,

    #[error(transparent)]
    Mint(#[from] MintError),

    #[error(transparent)]
    Crypto(#[from] BdhkeError),
}

pub type WalletResult<T> = Result<T, WalletError>;
