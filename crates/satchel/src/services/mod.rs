//! Authoritative accessors for the proof ledger, counters, mints and
//! the wallet cache.

pub mod counters;
pub mod issue;
pub mod mints;
pub mod proofs;
pub mod wallets;

pub use counters::{CounterRange, CounterService};
pub use issue::IssueService;
pub use mints::MintService;
pub use proofs::{OutputPlan, ProofService};
pub use wallets::WalletService;
