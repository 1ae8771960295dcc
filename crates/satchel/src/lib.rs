//! Local-first Chaumian ecash wallet core.
//!
//! Satchel holds a user's bearer proofs across one or more mints and
//! coordinates sending, receiving, minting against Lightning invoices,
//! melting to pay invoices, and restoring from seed. Every multi-step
//! operation is persisted as a saga so a crash at any point never loses
//! funds or produces double-spendable state.
//!
//! The entry point is [`WalletCore`], built with [`WalletCoreBuilder`].

pub mod builder;
pub mod core;
pub mod events;
pub mod operations;
pub mod services;
pub mod transport;
pub mod wallet;
pub mod watchers;

pub use satchel_common::{
    database, Amount, CurrencyUnit, Error, MintUrl, ProofRecord, ProofState, ProofToken,
};

pub use self::builder::WalletCoreBuilder;
pub use self::core::WalletCore;
pub use self::events::{EventBus, EventKind, WalletEvent};
pub use self::transport::http::{HttpMintClient, MintClient, RateLimitConfig};
pub use self::transport::ws::SubscriptionManager;

/// Callback producing the wallet's 64-byte BIP-39 seed on demand.
pub type SeedProvider =
    std::sync::Arc<dyn Fn() -> Result<[u8; 64], Error> + Send + Sync + 'static>;
