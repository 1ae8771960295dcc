//! In-memory reference backend.
//!
//! Keeps the whole wallet state in one structure behind a mutex. A
//! transaction clones the state, stages writes against the clone and
//! swaps it back on commit while holding the lock, so concurrent
//! top-level transactions are serialized and rollback is a drop.
//! Suitable for ephemeral wallets and tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use cashu::nuts::{Id, PublicKey, SecretKey};
use cashu::secret::Secret;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{Error, StorageReads, StorageTransaction, WalletStorage};
use crate::history::HistoryEntry;
use crate::keyset::KeysetRecord;
use crate::mint::MintRecord;
use crate::mint_url::MintUrl;
use crate::operation::{MeltOperation, SendOperation};
use crate::proof::{ProofRecord, ProofState};
use crate::quotes::{MeltQuote, MintQuote};

#[derive(Debug, Default, Clone)]
struct Inner {
    mints: HashMap<MintUrl, MintRecord>,
    keysets: HashMap<MintUrl, HashMap<Id, KeysetRecord>>,
    counters: HashMap<(MintUrl, Id), u32>,
    proofs: HashMap<(MintUrl, Secret), ProofRecord>,
    mint_quotes: HashMap<(MintUrl, String), MintQuote>,
    melt_quotes: HashMap<(MintUrl, String), MeltQuote>,
    send_operations: HashMap<Uuid, SendOperation>,
    melt_operations: HashMap<Uuid, MeltOperation>,
    history: Vec<HistoryEntry>,
    keypairs: HashMap<PublicKey, SecretKey>,
}

fn sorted_proofs<'a>(records: impl Iterator<Item = &'a ProofRecord>) -> Vec<ProofRecord> {
    let mut out: Vec<ProofRecord> = records.cloned().collect();
    out.sort_by(|a, b| {
        a.amount()
            .cmp(&b.amount())
            .then_with(|| a.secret().cmp(b.secret()))
    });
    out
}

impl Inner {
    fn proofs_of_mint<'a>(
        &'a self,
        mint_url: &'a MintUrl,
    ) -> impl Iterator<Item = &'a ProofRecord> + 'a {
        self.proofs
            .iter()
            .filter(move |((mint, _), _)| mint == mint_url)
            .map(|(_, record)| record)
    }

    fn mint(&self, mint_url: &MintUrl) -> Option<MintRecord> {
        self.mints.get(mint_url).cloned()
    }

    fn all_mints(&self) -> Vec<MintRecord> {
        let mut mints: Vec<MintRecord> = self.mints.values().cloned().collect();
        mints.sort_by(|a, b| a.mint_url.cmp(&b.mint_url));
        mints
    }

    fn keysets_of(&self, mint_url: &MintUrl) -> Vec<KeysetRecord> {
        let mut keysets: Vec<KeysetRecord> = self
            .keysets
            .get(mint_url)
            .map(|by_id| by_id.values().cloned().collect())
            .unwrap_or_default();
        keysets.sort_by_key(|keyset| keyset.id.to_string());
        keysets
    }

    fn keyset(&self, mint_url: &MintUrl, keyset_id: &Id) -> Option<KeysetRecord> {
        self.keysets
            .get(mint_url)
            .and_then(|by_id| by_id.get(keyset_id))
            .cloned()
    }

    fn counter(&self, mint_url: &MintUrl, keyset_id: &Id) -> Option<u32> {
        self.counters.get(&(mint_url.clone(), *keyset_id)).copied()
    }

    fn proofs_all(&self, mint_url: &MintUrl) -> Vec<ProofRecord> {
        sorted_proofs(self.proofs_of_mint(mint_url))
    }

    fn proofs_ready(&self, mint_url: &MintUrl) -> Vec<ProofRecord> {
        sorted_proofs(
            self.proofs_of_mint(mint_url)
                .filter(|record| record.state == ProofState::Ready),
        )
    }

    fn proofs_available(&self, mint_url: &MintUrl) -> Vec<ProofRecord> {
        sorted_proofs(
            self.proofs_of_mint(mint_url)
                .filter(|record| record.is_available()),
        )
    }

    fn proofs_inflight(&self) -> Vec<ProofRecord> {
        sorted_proofs(
            self.proofs
                .values()
                .filter(|record| record.state == ProofState::Inflight),
        )
    }

    fn proofs_reserved(&self) -> Vec<ProofRecord> {
        sorted_proofs(
            self.proofs
                .values()
                .filter(|record| record.used_by_operation.is_some()),
        )
    }

    fn proofs_by_secrets(&self, mint_url: &MintUrl, secrets: &[Secret]) -> Vec<ProofRecord> {
        secrets
            .iter()
            .filter_map(|secret| self.proofs.get(&(mint_url.clone(), secret.clone())).cloned())
            .collect()
    }

    fn proofs_by_operation(&self, mint_url: &MintUrl, operation_id: Uuid) -> Vec<ProofRecord> {
        sorted_proofs(self.proofs_of_mint(mint_url).filter(|record| {
            record.used_by_operation == Some(operation_id)
                || record.created_by_operation == Some(operation_id)
        }))
    }

    fn mint_quote(&self, mint_url: &MintUrl, quote_id: &str) -> Option<MintQuote> {
        self.mint_quotes
            .get(&(mint_url.clone(), quote_id.to_string()))
            .cloned()
    }

    fn pending_mint_quotes(&self) -> Vec<MintQuote> {
        let mut quotes: Vec<MintQuote> = self
            .mint_quotes
            .values()
            .filter(|quote| quote.is_pending())
            .cloned()
            .collect();
        quotes.sort_by(|a, b| a.id.cmp(&b.id));
        quotes
    }

    fn melt_quote(&self, mint_url: &MintUrl, quote_id: &str) -> Option<MeltQuote> {
        self.melt_quotes
            .get(&(mint_url.clone(), quote_id.to_string()))
            .cloned()
    }

    fn pending_melt_quotes(&self) -> Vec<MeltQuote> {
        let mut quotes: Vec<MeltQuote> = self
            .melt_quotes
            .values()
            .filter(|quote| quote.is_pending())
            .cloned()
            .collect();
        quotes.sort_by(|a, b| a.id.cmp(&b.id));
        quotes
    }

    fn send_operation(&self, id: Uuid) -> Option<SendOperation> {
        self.send_operations.get(&id).cloned()
    }

    fn all_send_operations(&self) -> Vec<SendOperation> {
        let mut operations: Vec<SendOperation> = self.send_operations.values().cloned().collect();
        operations.sort_by_key(|op| (op.created_at, op.id));
        operations
    }

    fn melt_operation(&self, id: Uuid) -> Option<MeltOperation> {
        self.melt_operations.get(&id).cloned()
    }

    fn all_melt_operations(&self) -> Vec<MeltOperation> {
        let mut operations: Vec<MeltOperation> = self.melt_operations.values().cloned().collect();
        operations.sort_by_key(|op| (op.created_at, op.id));
        operations
    }

    fn history_for(&self, mint_url: Option<&MintUrl>) -> Vec<HistoryEntry> {
        let mut entries: Vec<HistoryEntry> = self
            .history
            .iter()
            .filter(|entry| mint_url.map_or(true, |url| &entry.mint_url == url))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        entries
    }

    fn keypair(&self, pubkey: &PublicKey) -> Option<SecretKey> {
        self.keypairs.get(pubkey).cloned()
    }

    fn all_keypairs(&self) -> Vec<SecretKey> {
        self.keypairs.values().cloned().collect()
    }
}

/// In-memory wallet storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageReads for MemoryStore {
    async fn get_mint(&self, mint_url: &MintUrl) -> Result<Option<MintRecord>, Error> {
        Ok(self.inner.lock().await.mint(mint_url))
    }

    async fn get_mints(&self) -> Result<Vec<MintRecord>, Error> {
        Ok(self.inner.lock().await.all_mints())
    }

    async fn get_keysets(&self, mint_url: &MintUrl) -> Result<Vec<KeysetRecord>, Error> {
        Ok(self.inner.lock().await.keysets_of(mint_url))
    }

    async fn get_keyset(
        &self,
        mint_url: &MintUrl,
        keyset_id: &Id,
    ) -> Result<Option<KeysetRecord>, Error> {
        Ok(self.inner.lock().await.keyset(mint_url, keyset_id))
    }

    async fn get_counter(
        &self,
        mint_url: &MintUrl,
        keyset_id: &Id,
    ) -> Result<Option<u32>, Error> {
        Ok(self.inner.lock().await.counter(mint_url, keyset_id))
    }

    async fn get_proofs(&self, mint_url: &MintUrl) -> Result<Vec<ProofRecord>, Error> {
        Ok(self.inner.lock().await.proofs_all(mint_url))
    }

    async fn get_ready_proofs(&self, mint_url: &MintUrl) -> Result<Vec<ProofRecord>, Error> {
        Ok(self.inner.lock().await.proofs_ready(mint_url))
    }

    async fn get_available_proofs(&self, mint_url: &MintUrl) -> Result<Vec<ProofRecord>, Error> {
        Ok(self.inner.lock().await.proofs_available(mint_url))
    }

    async fn get_inflight_proofs(&self) -> Result<Vec<ProofRecord>, Error> {
        Ok(self.inner.lock().await.proofs_inflight())
    }

    async fn get_reserved_proofs(&self) -> Result<Vec<ProofRecord>, Error> {
        Ok(self.inner.lock().await.proofs_reserved())
    }

    async fn get_proofs_by_secrets(
        &self,
        mint_url: &MintUrl,
        secrets: &[Secret],
    ) -> Result<Vec<ProofRecord>, Error> {
        Ok(self.inner.lock().await.proofs_by_secrets(mint_url, secrets))
    }

    async fn get_proofs_by_operation(
        &self,
        mint_url: &MintUrl,
        operation_id: Uuid,
    ) -> Result<Vec<ProofRecord>, Error> {
        Ok(self
            .inner
            .lock()
            .await
            .proofs_by_operation(mint_url, operation_id))
    }

    async fn get_mint_quote(
        &self,
        mint_url: &MintUrl,
        quote_id: &str,
    ) -> Result<Option<MintQuote>, Error> {
        Ok(self.inner.lock().await.mint_quote(mint_url, quote_id))
    }

    async fn get_pending_mint_quotes(&self) -> Result<Vec<MintQuote>, Error> {
        Ok(self.inner.lock().await.pending_mint_quotes())
    }

    async fn get_melt_quote(
        &self,
        mint_url: &MintUrl,
        quote_id: &str,
    ) -> Result<Option<MeltQuote>, Error> {
        Ok(self.inner.lock().await.melt_quote(mint_url, quote_id))
    }

    async fn get_pending_melt_quotes(&self) -> Result<Vec<MeltQuote>, Error> {
        Ok(self.inner.lock().await.pending_melt_quotes())
    }

    async fn get_send_operation(&self, id: Uuid) -> Result<Option<SendOperation>, Error> {
        Ok(self.inner.lock().await.send_operation(id))
    }

    async fn get_send_operations(&self) -> Result<Vec<SendOperation>, Error> {
        Ok(self.inner.lock().await.all_send_operations())
    }

    async fn get_melt_operation(&self, id: Uuid) -> Result<Option<MeltOperation>, Error> {
        Ok(self.inner.lock().await.melt_operation(id))
    }

    async fn get_melt_operations(&self) -> Result<Vec<MeltOperation>, Error> {
        Ok(self.inner.lock().await.all_melt_operations())
    }

    async fn get_history(&self, mint_url: Option<&MintUrl>) -> Result<Vec<HistoryEntry>, Error> {
        Ok(self.inner.lock().await.history_for(mint_url))
    }

    async fn get_keypair(&self, pubkey: &PublicKey) -> Result<Option<SecretKey>, Error> {
        Ok(self.inner.lock().await.keypair(pubkey))
    }

    async fn get_keypairs(&self) -> Result<Vec<SecretKey>, Error> {
        Ok(self.inner.lock().await.all_keypairs())
    }
}

#[async_trait]
impl WalletStorage for MemoryStore {
    async fn begin_transaction(&self) -> Result<Box<dyn StorageTransaction>, Error> {
        let guard = self.inner.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemoryTransaction { guard, staged }))
    }
}

struct MemoryTransaction {
    guard: OwnedMutexGuard<Inner>,
    staged: Inner,
}

impl MemoryTransaction {
    fn require_mint(&self, mint_url: &MintUrl) -> Result<(), Error> {
        if self.staged.mints.contains_key(mint_url) {
            Ok(())
        } else {
            Err(Error::MissingMint(mint_url.clone()))
        }
    }
}

#[async_trait]
impl StorageReads for MemoryTransaction {
    async fn get_mint(&self, mint_url: &MintUrl) -> Result<Option<MintRecord>, Error> {
        Ok(self.staged.mint(mint_url))
    }

    async fn get_mints(&self) -> Result<Vec<MintRecord>, Error> {
        Ok(self.staged.all_mints())
    }

    async fn get_keysets(&self, mint_url: &MintUrl) -> Result<Vec<KeysetRecord>, Error> {
        Ok(self.staged.keysets_of(mint_url))
    }

    async fn get_keyset(
        &self,
        mint_url: &MintUrl,
        keyset_id: &Id,
    ) -> Result<Option<KeysetRecord>, Error> {
        Ok(self.staged.keyset(mint_url, keyset_id))
    }

    async fn get_counter(
        &self,
        mint_url: &MintUrl,
        keyset_id: &Id,
    ) -> Result<Option<u32>, Error> {
        Ok(self.staged.counter(mint_url, keyset_id))
    }

    async fn get_proofs(&self, mint_url: &MintUrl) -> Result<Vec<ProofRecord>, Error> {
        Ok(self.staged.proofs_all(mint_url))
    }

    async fn get_ready_proofs(&self, mint_url: &MintUrl) -> Result<Vec<ProofRecord>, Error> {
        Ok(self.staged.proofs_ready(mint_url))
    }

    async fn get_available_proofs(&self, mint_url: &MintUrl) -> Result<Vec<ProofRecord>, Error> {
        Ok(self.staged.proofs_available(mint_url))
    }

    async fn get_inflight_proofs(&self) -> Result<Vec<ProofRecord>, Error> {
        Ok(self.staged.proofs_inflight())
    }

    async fn get_reserved_proofs(&self) -> Result<Vec<ProofRecord>, Error> {
        Ok(self.staged.proofs_reserved())
    }

    async fn get_proofs_by_secrets(
        &self,
        mint_url: &MintUrl,
        secrets: &[Secret],
    ) -> Result<Vec<ProofRecord>, Error> {
        Ok(self.staged.proofs_by_secrets(mint_url, secrets))
    }

    async fn get_proofs_by_operation(
        &self,
        mint_url: &MintUrl,
        operation_id: Uuid,
    ) -> Result<Vec<ProofRecord>, Error> {
        Ok(self.staged.proofs_by_operation(mint_url, operation_id))
    }

    async fn get_mint_quote(
        &self,
        mint_url: &MintUrl,
        quote_id: &str,
    ) -> Result<Option<MintQuote>, Error> {
        Ok(self.staged.mint_quote(mint_url, quote_id))
    }

    async fn get_pending_mint_quotes(&self) -> Result<Vec<MintQuote>, Error> {
        Ok(self.staged.pending_mint_quotes())
    }

    async fn get_melt_quote(
        &self,
        mint_url: &MintUrl,
        quote_id: &str,
    ) -> Result<Option<MeltQuote>, Error> {
        Ok(self.staged.melt_quote(mint_url, quote_id))
    }

    async fn get_pending_melt_quotes(&self) -> Result<Vec<MeltQuote>, Error> {
        Ok(self.staged.pending_melt_quotes())
    }

    async fn get_send_operation(&self, id: Uuid) -> Result<Option<SendOperation>, Error> {
        Ok(self.staged.send_operation(id))
    }

    async fn get_send_operations(&self) -> Result<Vec<SendOperation>, Error> {
        Ok(self.staged.all_send_operations())
    }

    async fn get_melt_operation(&self, id: Uuid) -> Result<Option<MeltOperation>, Error> {
        Ok(self.staged.melt_operation(id))
    }

    async fn get_melt_operations(&self) -> Result<Vec<MeltOperation>, Error> {
        Ok(self.staged.all_melt_operations())
    }

    async fn get_history(&self, mint_url: Option<&MintUrl>) -> Result<Vec<HistoryEntry>, Error> {
        Ok(self.staged.history_for(mint_url))
    }

    async fn get_keypair(&self, pubkey: &PublicKey) -> Result<Option<SecretKey>, Error> {
        Ok(self.staged.keypair(pubkey))
    }

    async fn get_keypairs(&self) -> Result<Vec<SecretKey>, Error> {
        Ok(self.staged.all_keypairs())
    }
}

#[async_trait]
impl StorageTransaction for MemoryTransaction {
    async fn add_mint(&mut self, mint: MintRecord) -> Result<(), Error> {
        self.staged.mints.insert(mint.mint_url.clone(), mint);
        Ok(())
    }

    async fn remove_mint(&mut self, mint_url: &MintUrl) -> Result<(), Error> {
        self.staged.mints.remove(mint_url);
        self.staged.keysets.remove(mint_url);
        self.staged.counters.retain(|(mint, _), _| mint != mint_url);
        Ok(())
    }

    async fn add_keysets(&mut self, keysets: Vec<KeysetRecord>) -> Result<(), Error> {
        for keyset in keysets {
            self.require_mint(&keyset.mint_url)?;
            self.staged
                .keysets
                .entry(keyset.mint_url.clone())
                .or_default()
                .insert(keyset.id, keyset);
        }
        Ok(())
    }

    async fn set_counter(
        &mut self,
        mint_url: &MintUrl,
        keyset_id: &Id,
        value: u32,
    ) -> Result<(), Error> {
        self.require_mint(mint_url)?;
        self.staged
            .counters
            .insert((mint_url.clone(), *keyset_id), value);
        Ok(())
    }

    async fn save_proofs(&mut self, proofs: Vec<ProofRecord>) -> Result<(), Error> {
        for record in &proofs {
            self.require_mint(&record.mint_url)?;
            let key = (record.mint_url.clone(), record.secret().clone());
            if self.staged.proofs.contains_key(&key) {
                return Err(Error::DuplicateProof(record.mint_url.clone()));
            }
        }
        for record in proofs {
            let key = (record.mint_url.clone(), record.secret().clone());
            self.staged.proofs.insert(key, record);
        }
        Ok(())
    }

    async fn reserve_proofs(
        &mut self,
        mint_url: &MintUrl,
        secrets: &[Secret],
        operation_id: Uuid,
    ) -> Result<(), Error> {
        for secret in secrets {
            let record = self
                .staged
                .proofs
                .get(&(mint_url.clone(), secret.clone()))
                .ok_or(Error::ProofNotFound)?;
            if record.state != ProofState::Ready {
                return Err(Error::ProofNotReady);
            }
            if let Some(owner) = record.used_by_operation {
                return Err(Error::AlreadyReserved(owner));
            }
        }
        for secret in secrets {
            if let Some(record) = self
                .staged
                .proofs
                .get_mut(&(mint_url.clone(), secret.clone()))
            {
                record.used_by_operation = Some(operation_id);
            }
        }
        Ok(())
    }

    async fn release_proofs(
        &mut self,
        mint_url: &MintUrl,
        secrets: &[Secret],
    ) -> Result<(), Error> {
        for secret in secrets {
            if let Some(record) = self
                .staged
                .proofs
                .get_mut(&(mint_url.clone(), secret.clone()))
            {
                record.used_by_operation = None;
            }
        }
        Ok(())
    }

    async fn set_proof_state(
        &mut self,
        mint_url: &MintUrl,
        secrets: &[Secret],
        state: ProofState,
    ) -> Result<(), Error> {
        for secret in secrets {
            let record = self
                .staged
                .proofs
                .get(&(mint_url.clone(), secret.clone()))
                .ok_or(Error::ProofNotFound)?;
            if record.state == ProofState::Spent && state != ProofState::Spent {
                return Err(Error::AttemptUpdateSpentProof);
            }
        }
        for secret in secrets {
            if let Some(record) = self
                .staged
                .proofs
                .get_mut(&(mint_url.clone(), secret.clone()))
            {
                record.state = state;
            }
        }
        Ok(())
    }

    async fn wipe_proofs_by_keyset(
        &mut self,
        mint_url: &MintUrl,
        keyset_id: &Id,
    ) -> Result<(), Error> {
        self.staged
            .proofs
            .retain(|(mint, _), record| mint != mint_url || record.keyset_id() != *keyset_id);
        Ok(())
    }

    async fn add_mint_quote(&mut self, quote: MintQuote) -> Result<(), Error> {
        self.require_mint(&quote.mint_url)?;
        self.staged
            .mint_quotes
            .insert((quote.mint_url.clone(), quote.id.clone()), quote);
        Ok(())
    }

    async fn remove_mint_quote(
        &mut self,
        mint_url: &MintUrl,
        quote_id: &str,
    ) -> Result<(), Error> {
        self.staged
            .mint_quotes
            .remove(&(mint_url.clone(), quote_id.to_string()));
        Ok(())
    }

    async fn add_melt_quote(&mut self, quote: MeltQuote) -> Result<(), Error> {
        self.require_mint(&quote.mint_url)?;
        self.staged
            .melt_quotes
            .insert((quote.mint_url.clone(), quote.id.clone()), quote);
        Ok(())
    }

    async fn remove_melt_quote(
        &mut self,
        mint_url: &MintUrl,
        quote_id: &str,
    ) -> Result<(), Error> {
        self.staged
            .melt_quotes
            .remove(&(mint_url.clone(), quote_id.to_string()));
        Ok(())
    }

    async fn upsert_send_operation(&mut self, operation: SendOperation) -> Result<(), Error> {
        operation
            .validate()
            .map_err(|e| Error::InvalidRecord(e.to_string()))?;
        self.staged.send_operations.insert(operation.id, operation);
        Ok(())
    }

    async fn delete_send_operation(&mut self, id: Uuid) -> Result<(), Error> {
        self.staged.send_operations.remove(&id);
        Ok(())
    }

    async fn upsert_melt_operation(&mut self, operation: MeltOperation) -> Result<(), Error> {
        operation
            .validate()
            .map_err(|e| Error::InvalidRecord(e.to_string()))?;
        self.staged.melt_operations.insert(operation.id, operation);
        Ok(())
    }

    async fn delete_melt_operation(&mut self, id: Uuid) -> Result<(), Error> {
        self.staged.melt_operations.remove(&id);
        Ok(())
    }

    async fn add_history(&mut self, entry: HistoryEntry) -> Result<(), Error> {
        self.staged.history.push(entry);
        Ok(())
    }

    async fn add_keypair(&mut self, secret_key: SecretKey) -> Result<(), Error> {
        self.staged
            .keypairs
            .insert(secret_key.public_key(), secret_key);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), Error> {
        let mut guard = self.guard;
        *guard = self.staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::time::Duration;

    use cashu::nuts::{CurrencyUnit, Proof};
    use cashu::Amount;

    use super::*;

    fn mint_url() -> MintUrl {
        MintUrl::from_str("https://mint.example.com").unwrap()
    }

    fn keyset_id() -> Id {
        Id::from_str("00916bbf7ef91a36").unwrap()
    }

    fn proof_record(amount: u64) -> ProofRecord {
        let proof = Proof::new(
            Amount::from(amount),
            keyset_id(),
            Secret::generate(),
            SecretKey::generate().public_key(),
        );
        ProofRecord::new(proof, mint_url(), ProofState::Ready, CurrencyUnit::Sat).unwrap()
    }

    async fn store_with_mint() -> MemoryStore {
        let store = MemoryStore::new();
        let mut tx = store.begin_transaction().await.unwrap();
        tx.add_mint(MintRecord::new(mint_url(), None)).await.unwrap();
        tx.commit().await.unwrap();
        store
    }

    #[tokio::test]
    async fn save_proofs_rejects_duplicates() {
        let store = store_with_mint().await;
        let record = proof_record(8);

        let mut tx = store.begin_transaction().await.unwrap();
        tx.save_proofs(vec![record.clone()]).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin_transaction().await.unwrap();
        let err = tx.save_proofs(vec![record]).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateProof(_)));
    }

    #[tokio::test]
    async fn reserve_is_all_or_none() {
        let store = store_with_mint().await;
        let available = proof_record(8);
        let reserved = proof_record(4);
        let op_a = Uuid::new_v4();
        let op_b = Uuid::new_v4();

        let mut tx = store.begin_transaction().await.unwrap();
        tx.save_proofs(vec![available.clone(), reserved.clone()])
            .await
            .unwrap();
        tx.reserve_proofs(&mint_url(), &[reserved.secret().clone()], op_a)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin_transaction().await.unwrap();
        let err = tx
            .reserve_proofs(
                &mint_url(),
                &[available.secret().clone(), reserved.secret().clone()],
                op_b,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyReserved(op) if op == op_a));
        tx.rollback().await.unwrap();

        // The failed batch must not have reserved the available proof.
        let proofs = store.get_available_proofs(&mint_url()).await.unwrap();
        assert_eq!(proofs.len(), 1);
        assert_eq!(proofs[0].secret(), available.secret());
    }

    #[tokio::test]
    async fn available_excludes_reserved_and_non_ready() {
        let store = store_with_mint().await;
        let ready = proof_record(8);
        let inflight = proof_record(4);
        let reserved = proof_record(2);

        let mut tx = store.begin_transaction().await.unwrap();
        tx.save_proofs(vec![ready.clone(), inflight.clone(), reserved.clone()])
            .await
            .unwrap();
        tx.set_proof_state(
            &mint_url(),
            &[inflight.secret().clone()],
            ProofState::Inflight,
        )
        .await
        .unwrap();
        tx.reserve_proofs(&mint_url(), &[reserved.secret().clone()], Uuid::new_v4())
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let available = store.get_available_proofs(&mint_url()).await.unwrap();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].secret(), ready.secret());

        // Ready includes the reserved proof by contract.
        let ready_proofs = store.get_ready_proofs(&mint_url()).await.unwrap();
        assert_eq!(ready_proofs.len(), 2);
    }

    #[tokio::test]
    async fn spent_is_terminal() {
        let store = store_with_mint().await;
        let record = proof_record(8);

        let mut tx = store.begin_transaction().await.unwrap();
        tx.save_proofs(vec![record.clone()]).await.unwrap();
        tx.set_proof_state(&mint_url(), &[record.secret().clone()], ProofState::Spent)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin_transaction().await.unwrap();
        let err = tx
            .set_proof_state(&mint_url(), &[record.secret().clone()], ProofState::Ready)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AttemptUpdateSpentProof));
    }

    #[tokio::test]
    async fn rollback_discards_staged_writes() {
        let store = store_with_mint().await;

        let mut tx = store.begin_transaction().await.unwrap();
        tx.set_counter(&mint_url(), &keyset_id(), 7).await.unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(
            store.get_counter(&mint_url(), &keyset_id()).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn dependent_rows_require_mint() {
        let store = MemoryStore::new();
        let mut tx = store.begin_transaction().await.unwrap();
        let err = tx.save_proofs(vec![proof_record(8)]).await.unwrap_err();
        assert!(matches!(err, Error::MissingMint(_)));
    }

    #[tokio::test]
    async fn concurrent_transactions_serialize() {
        let store = store_with_mint().await;

        let tx1 = store.begin_transaction().await.unwrap();

        let store2 = store.clone();
        let second = tokio::spawn(async move {
            let mut tx2 = store2.begin_transaction().await.unwrap();
            tx2.set_counter(&mint_url(), &keyset_id(), 1).await.unwrap();
            tx2.commit().await.unwrap();
        });

        // The second transaction cannot start while the first is open.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished());

        tx1.commit().await.unwrap();
        second.await.unwrap();

        assert_eq!(
            store.get_counter(&mint_url(), &keyset_id()).await.unwrap(),
            Some(1)
        );
    }
}
