//! Errors

use cashu::nuts::Id;
use thiserror::Error;

use crate::mint_url::MintUrl;

/// Satchel error
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid parameter supplied by the caller
    #[error("Validation error: {0}")]
    Validation(String),
    /// Mint is not known to this wallet
    #[error("Unknown mint: `{0}`")]
    UnknownMint(MintUrl),
    /// Mint is known but not trusted
    #[error("Untrusted mint: `{0}`")]
    UntrustedMint(MintUrl),
    /// Wallet balance cannot cover the requested amount
    #[error("Insufficient balance")]
    InsufficientBalance,
    /// No active keyset for the requested unit
    #[error("No active keyset")]
    NoActiveKeyset,
    /// Malformed token, missing secret or unsupported lock script
    #[error("Proof validation failed: {0}")]
    ProofValidation(String),
    /// Persistence failed for one or more keyset groups
    #[error("Proof operation failed for keysets {keyset_ids:?}: {message}")]
    ProofOperation {
        /// Keysets whose proofs could not be persisted
        keyset_ids: Vec<Id>,
        /// Failure description
        message: String,
    },
    /// Network or protocol failure while fetching mint info
    #[error("Could not fetch mint info: {0}")]
    MintFetch(String),
    /// Network or protocol failure while syncing keysets
    #[error("Could not sync keysets: {0}")]
    KeysetSync(String),
    /// Non-2xx response without a mint protocol error body
    #[error("HTTP error ({status}): {message}")]
    HttpResponse {
        /// HTTP status code
        status: u16,
        /// Best-effort response body or status text
        message: String,
    },
    /// Mint returned a protocol error body
    #[error("Mint error ({code}): {detail}")]
    MintOperation {
        /// Mint error code
        code: i64,
        /// Mint error detail
        detail: String,
        /// HTTP status the error arrived with
        status: u16,
    },
    /// Transport-level failure (DNS, connect, reset)
    #[error("Network error: {0}")]
    Network(String),
    /// Attempted transition from an invalid operation state
    #[error("Invalid operation state: {0}")]
    InvalidOperationState(String),
    /// Operation not found
    #[error("Unknown operation: `{0}`")]
    UnknownOperation(uuid::Uuid),
    /// Quote not found
    #[error("Unknown quote: `{0}`")]
    UnknownQuote(String),
    /// Quote is expired
    #[error("Quote expired")]
    QuoteExpired,
    /// Amount arithmetic overflowed
    #[error("Amount overflow")]
    AmountOverflow,
    /// Mint URL error
    #[error(transparent)]
    MintUrl(#[from] crate::mint_url::Error),
    /// Database error
    #[error(transparent)]
    Database(#[from] crate::database::Error),
    /// DHKE error
    #[error(transparent)]
    Dhke(#[from] cashu::dhke::Error),
    /// NUT-00 error
    #[error(transparent)]
    Nut00(#[from] cashu::nuts::nut00::Error),
    /// NUT-11 error
    #[error(transparent)]
    Nut11(#[from] cashu::nuts::nut11::Error),
    /// NUT-13 derivation error
    #[error(transparent)]
    Nut13(#[from] cashu::nuts::nut13::Error),
    /// Secret error
    #[error(transparent)]
    Secret(#[from] cashu::secret::Error),
    /// Serde error
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    /// Custom error
    #[error("{0}")]
    Custom(String),
}
