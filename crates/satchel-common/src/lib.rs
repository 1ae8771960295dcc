//! Shared types and the storage contract for the satchel wallet core.
//!
//! This crate holds everything that is meaningful without a running
//! wallet: the normalized mint URL, the proof ledger records, locally
//! mirrored quote state machines, the persisted operation (saga)
//! records, and the [`database`] contract a storage backend implements.
//! The runtime lives in the `satchel` crate.

pub mod database;
pub mod error;
pub mod history;
pub mod keyset;
pub mod mint;
pub mod mint_url;
pub mod operation;
pub mod outputs;
pub mod proof;
pub mod quotes;
pub mod token;

pub use cashu::amount::Amount;
pub use cashu::nuts::{CurrencyUnit, Id, PublicKey, SecretKey};
pub use cashu::secret::Secret;

pub use self::error::Error;
pub use self::history::{HistoryEntry, HistoryKind};
pub use self::keyset::KeysetRecord;
pub use self::mint::MintRecord;
pub use self::mint_url::MintUrl;
pub use self::operation::{MeltOperation, SendOperation};
pub use self::outputs::{derive_outputs, OutputBlueprint, PlannedOutput};
pub use self::proof::{ProofRecord, ProofState};
pub use self::quotes::{MeltQuote, MeltQuoteState, MintQuote, MintQuoteState};
pub use self::token::ProofToken;

/// Seconds since the unix epoch.
pub fn unix_time() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
