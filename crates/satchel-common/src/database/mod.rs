//! Storage contract.
//!
//! A backend implements [`WalletStorage`]: snapshot reads plus
//! [`WalletStorage::begin_transaction`], which returns a
//! [`StorageTransaction`] carrying the same reads alongside every write.
//! All multi-row mutations go through a transaction; services that are
//! called from inside an active scope receive the live transaction
//! instead of opening their own, which is how nested scopes reuse the
//! outer transaction. Concurrent top-level transactions execute
//! serially.
//!
//! Events observed by the rest of the system must only reflect
//! committed state. A backend whose commit is asynchronous with respect
//! to durability must document that leak.

use std::fmt::Debug;

use async_trait::async_trait;
use cashu::nuts::{Id, PublicKey, SecretKey};
use cashu::secret::Secret;
use thiserror::Error;
use uuid::Uuid;

use crate::history::HistoryEntry;
use crate::keyset::KeysetRecord;
use crate::mint::MintRecord;
use crate::mint_url::MintUrl;
use crate::operation::{MeltOperation, SendOperation};
use crate::proof::{ProofRecord, ProofState};
use crate::quotes::{MeltQuote, MintQuote};

pub mod memory;

pub use memory::MemoryStore;

/// Storage error
#[derive(Debug, Error)]
pub enum Error {
    /// A proof with the same `(mint, secret)` already exists
    #[error("Duplicate proof for mint `{0}`")]
    DuplicateProof(MintUrl),
    /// Proof not found
    #[error("Proof not found")]
    ProofNotFound,
    /// Proof exists but is not in the ready state
    #[error("Proof is not ready")]
    ProofNotReady,
    /// Proof is already reserved by a live operation
    #[error("Proof already reserved by operation `{0}`")]
    AlreadyReserved(Uuid),
    /// A spent proof can never change state again
    #[error("Attempt to update state of spent proof")]
    AttemptUpdateSpentProof,
    /// Dependent row references a mint that does not exist
    #[error("Mint `{0}` is not known")]
    MissingMint(MintUrl),
    /// Operation not found
    #[error("Unknown operation `{0}`")]
    UnknownOperation(Uuid),
    /// Record failed its consistency check
    #[error("Invalid record: {0}")]
    InvalidRecord(String),
    /// Serialization error
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    /// Backend-specific error
    #[error(transparent)]
    Backend(Box<dyn std::error::Error + Send + Sync>),
}

/// Read side of the repositories, shared by [`WalletStorage`] and
/// [`StorageTransaction`].
#[async_trait]
pub trait StorageReads: Send + Sync {
    /// Get a mint by its normalized URL.
    async fn get_mint(&self, mint_url: &MintUrl) -> Result<Option<MintRecord>, Error>;

    /// Get all known mints.
    async fn get_mints(&self) -> Result<Vec<MintRecord>, Error>;

    /// Get all keysets of a mint.
    async fn get_keysets(&self, mint_url: &MintUrl) -> Result<Vec<KeysetRecord>, Error>;

    /// Get one keyset.
    async fn get_keyset(
        &self,
        mint_url: &MintUrl,
        keyset_id: &Id,
    ) -> Result<Option<KeysetRecord>, Error>;

    /// Get the output counter for a keyset, if one was ever persisted.
    async fn get_counter(&self, mint_url: &MintUrl, keyset_id: &Id)
        -> Result<Option<u32>, Error>;

    /// Get every proof of a mint, regardless of state.
    async fn get_proofs(&self, mint_url: &MintUrl) -> Result<Vec<ProofRecord>, Error>;

    /// Get proofs with `state = ready`, including reserved ones.
    async fn get_ready_proofs(&self, mint_url: &MintUrl) -> Result<Vec<ProofRecord>, Error>;

    /// Get proofs with `state = ready` and no reservation.
    async fn get_available_proofs(&self, mint_url: &MintUrl) -> Result<Vec<ProofRecord>, Error>;

    /// Get every inflight proof across all mints.
    async fn get_inflight_proofs(&self) -> Result<Vec<ProofRecord>, Error>;

    /// Get every reserved proof across all mints.
    async fn get_reserved_proofs(&self) -> Result<Vec<ProofRecord>, Error>;

    /// Get the proofs of a mint matching the given secrets. Unknown
    /// secrets are simply absent from the result.
    async fn get_proofs_by_secrets(
        &self,
        mint_url: &MintUrl,
        secrets: &[Secret],
    ) -> Result<Vec<ProofRecord>, Error>;

    /// Get the proofs a live operation reserved or created.
    async fn get_proofs_by_operation(
        &self,
        mint_url: &MintUrl,
        operation_id: Uuid,
    ) -> Result<Vec<ProofRecord>, Error>;

    /// Get a mint quote.
    async fn get_mint_quote(
        &self,
        mint_url: &MintUrl,
        quote_id: &str,
    ) -> Result<Option<MintQuote>, Error>;

    /// Get every mint quote that is not yet ISSUED.
    async fn get_pending_mint_quotes(&self) -> Result<Vec<MintQuote>, Error>;

    /// Get a melt quote.
    async fn get_melt_quote(
        &self,
        mint_url: &MintUrl,
        quote_id: &str,
    ) -> Result<Option<MeltQuote>, Error>;

    /// Get every melt quote that is not yet PAID.
    async fn get_pending_melt_quotes(&self) -> Result<Vec<MeltQuote>, Error>;

    /// Get a send operation.
    async fn get_send_operation(&self, id: Uuid) -> Result<Option<SendOperation>, Error>;

    /// Get every send operation.
    async fn get_send_operations(&self) -> Result<Vec<SendOperation>, Error>;

    /// Get a melt operation.
    async fn get_melt_operation(&self, id: Uuid) -> Result<Option<MeltOperation>, Error>;

    /// Get every melt operation.
    async fn get_melt_operations(&self) -> Result<Vec<MeltOperation>, Error>;

    /// Get history, optionally restricted to one mint, newest first.
    async fn get_history(&self, mint_url: Option<&MintUrl>) -> Result<Vec<HistoryEntry>, Error>;

    /// Get the secret key for a stored P2PK keypair.
    async fn get_keypair(&self, pubkey: &PublicKey) -> Result<Option<SecretKey>, Error>;

    /// Get every stored P2PK secret key.
    async fn get_keypairs(&self) -> Result<Vec<SecretKey>, Error>;
}

/// A wallet storage backend.
#[async_trait]
pub trait WalletStorage: StorageReads + Debug {
    /// Open a transaction. The scope is serialized against concurrent
    /// top-level callers; dropping the transaction without committing
    /// discards every staged write.
    async fn begin_transaction(&self) -> Result<Box<dyn StorageTransaction>, Error>;
}

/// A transaction-scoped view of the repositories.
#[async_trait]
pub trait StorageTransaction: StorageReads {
    /// Insert or update a mint.
    async fn add_mint(&mut self, mint: MintRecord) -> Result<(), Error>;

    /// Remove a mint; cascades to its keysets and counters.
    async fn remove_mint(&mut self, mint_url: &MintUrl) -> Result<(), Error>;

    /// Insert or update keysets. The owning mint must exist.
    async fn add_keysets(&mut self, keysets: Vec<KeysetRecord>) -> Result<(), Error>;

    /// Set a keyset counter. This is the only counter mutation;
    /// callers wrap it in get-compute-set inside this transaction.
    async fn set_counter(
        &mut self,
        mint_url: &MintUrl,
        keyset_id: &Id,
        value: u32,
    ) -> Result<(), Error>;

    /// Insert new proofs atomically. Fails if any `(mint, secret)`
    /// already exists.
    async fn save_proofs(&mut self, proofs: Vec<ProofRecord>) -> Result<(), Error>;

    /// Atomically reserve the given proofs for an operation: all of
    /// them or none. Fails when any proof is missing, not ready, or
    /// already reserved.
    async fn reserve_proofs(
        &mut self,
        mint_url: &MintUrl,
        secrets: &[Secret],
        operation_id: Uuid,
    ) -> Result<(), Error>;

    /// Clear reservations. Unknown secrets are ignored.
    async fn release_proofs(&mut self, mint_url: &MintUrl, secrets: &[Secret])
        -> Result<(), Error>;

    /// Update proof states. Spent proofs never leave spent.
    async fn set_proof_state(
        &mut self,
        mint_url: &MintUrl,
        secrets: &[Secret],
        state: ProofState,
    ) -> Result<(), Error>;

    /// Recovery tool: drop every proof of a keyset.
    async fn wipe_proofs_by_keyset(
        &mut self,
        mint_url: &MintUrl,
        keyset_id: &Id,
    ) -> Result<(), Error>;

    /// Insert or update a mint quote.
    async fn add_mint_quote(&mut self, quote: MintQuote) -> Result<(), Error>;

    /// Remove a mint quote.
    async fn remove_mint_quote(&mut self, mint_url: &MintUrl, quote_id: &str)
        -> Result<(), Error>;

    /// Insert or update a melt quote.
    async fn add_melt_quote(&mut self, quote: MeltQuote) -> Result<(), Error>;

    /// Remove a melt quote.
    async fn remove_melt_quote(&mut self, mint_url: &MintUrl, quote_id: &str)
        -> Result<(), Error>;

    /// Insert or update a send operation. Inconsistent records are
    /// rejected.
    async fn upsert_send_operation(&mut self, operation: SendOperation) -> Result<(), Error>;

    /// Delete a send operation.
    async fn delete_send_operation(&mut self, id: Uuid) -> Result<(), Error>;

    /// Insert or update a melt operation. Inconsistent records are
    /// rejected.
    async fn upsert_melt_operation(&mut self, operation: MeltOperation) -> Result<(), Error>;

    /// Delete a melt operation.
    async fn delete_melt_operation(&mut self, id: Uuid) -> Result<(), Error>;

    /// Append a history entry.
    async fn add_history(&mut self, entry: HistoryEntry) -> Result<(), Error>;

    /// Store a P2PK keypair.
    async fn add_keypair(&mut self, secret_key: SecretKey) -> Result<(), Error>;

    /// Commit every staged write.
    async fn commit(self: Box<Self>) -> Result<(), Error>;

    /// Discard every staged write.
    async fn rollback(self: Box<Self>) -> Result<(), Error>;
}
