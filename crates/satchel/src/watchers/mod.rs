//! Background watchers bridging mint notifications to service calls.

pub mod mint_quotes;
pub mod proof_state;

pub use mint_quotes::MintQuoteWatcher;
pub use proof_state::ProofStateWatcher;
