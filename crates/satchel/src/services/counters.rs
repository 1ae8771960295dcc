//! Deterministic output counter service.
//!
//! The counter of a keyset is the next unused derivation index. It is
//! strictly non-decreasing in the normal path; only
//! [`CounterService::overwrite`] may move it arbitrarily, and it never
//! moves it down.

use std::sync::Arc;

use cashu::nuts::Id;
use satchel_common::database::{StorageTransaction, WalletStorage};
use satchel_common::mint_url::MintUrl;
use satchel_common::Error;

use crate::events::{EventBus, WalletEvent};

/// The derivation indices an increment handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterRange {
    /// First index of the range
    pub start: u32,
    /// One past the last index
    pub end: u32,
}

/// Counter accessor.
#[derive(Debug, Clone)]
pub struct CounterService {
    storage: Arc<dyn WalletStorage>,
    events: Arc<EventBus>,
}

impl CounterService {
    /// Create the service.
    pub fn new(storage: Arc<dyn WalletStorage>, events: Arc<EventBus>) -> Self {
        Self { storage, events }
    }

    /// Current counter value, initializing a missing counter to 0 so
    /// subsequent reads are stable.
    pub async fn get(&self, mint_url: &MintUrl, keyset_id: &Id) -> Result<u32, Error> {
        if let Some(value) = self.storage.get_counter(mint_url, keyset_id).await? {
            return Ok(value);
        }

        let mut tx = self.storage.begin_transaction().await?;
        // A racing initializer may have persisted the counter by now.
        let value = match tx.get_counter(mint_url, keyset_id).await? {
            Some(value) => value,
            None => {
                tx.set_counter(mint_url, keyset_id, 0).await?;
                0
            }
        };
        tx.commit().await?;
        Ok(value)
    }

    /// Advance the counter by `count` inside the caller's transaction.
    ///
    /// Returns the range of indices handed out. The caller owns the
    /// commit and must emit the returned event after it.
    pub async fn increment_in_tx(
        &self,
        tx: &mut dyn StorageTransaction,
        mint_url: &MintUrl,
        keyset_id: &Id,
        count: u32,
    ) -> Result<(CounterRange, WalletEvent), Error> {
        let start = tx.get_counter(mint_url, keyset_id).await?.unwrap_or(0);
        let end = start
            .checked_add(count)
            .ok_or_else(|| Error::Validation("keyset counter overflow".to_string()))?;
        tx.set_counter(mint_url, keyset_id, end).await?;

        Ok((
            CounterRange { start, end },
            WalletEvent::CounterUpdated {
                mint_url: mint_url.clone(),
                keyset_id: *keyset_id,
                value: end,
            },
        ))
    }

    /// Advance the counter by `count` in its own transaction.
    pub async fn increment(
        &self,
        mint_url: &MintUrl,
        keyset_id: &Id,
        count: u32,
    ) -> Result<CounterRange, Error> {
        let mut tx = self.storage.begin_transaction().await?;
        let (range, event) = self
            .increment_in_tx(tx.as_mut(), mint_url, keyset_id, count)
            .await?;
        tx.commit().await?;
        self.events.emit(event).await;
        Ok(range)
    }

    /// Recovery tool: force the counter to `value`.
    ///
    /// Lowering the counter risks reusing derivation indices, so a
    /// lower target is ignored with a warning and the stored value
    /// wins.
    pub async fn overwrite(
        &self,
        mint_url: &MintUrl,
        keyset_id: &Id,
        value: u32,
    ) -> Result<u32, Error> {
        let mut tx = self.storage.begin_transaction().await?;
        let current = tx.get_counter(mint_url, keyset_id).await?.unwrap_or(0);

        if value < current {
            tracing::warn!(
                %mint_url,
                %keyset_id,
                current,
                requested = value,
                "refusing to lower keyset counter"
            );
            tx.rollback().await?;
            return Ok(current);
        }

        tx.set_counter(mint_url, keyset_id, value).await?;
        tx.commit().await?;

        self.events
            .emit(WalletEvent::CounterUpdated {
                mint_url: mint_url.clone(),
                keyset_id: *keyset_id,
                value,
            })
            .await;

        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::sync::atomic::{AtomicU32, Ordering};

    use satchel_common::database::MemoryStore;
    use satchel_common::mint::MintRecord;

    use super::*;
    use crate::events::EventKind;

    fn mint_url() -> MintUrl {
        MintUrl::from_str("https://mint.example.com").unwrap()
    }

    fn keyset_id() -> Id {
        Id::from_str("00916bbf7ef91a36").unwrap()
    }

    async fn service() -> (CounterService, Arc<MemoryStore>, Arc<EventBus>) {
        let storage = Arc::new(MemoryStore::new());
        let mut tx = storage.begin_transaction().await.unwrap();
        tx.add_mint(MintRecord::new(mint_url(), None)).await.unwrap();
        tx.commit().await.unwrap();

        let events = Arc::new(EventBus::new());
        (
            CounterService::new(storage.clone(), events.clone()),
            storage,
            events,
        )
    }

    #[tokio::test]
    async fn get_initializes_missing_counter_to_zero() {
        let (service, storage, _events) = service().await;

        assert_eq!(service.get(&mint_url(), &keyset_id()).await.unwrap(), 0);
        // The zero is persisted, not just returned.
        assert_eq!(
            storage.get_counter(&mint_url(), &keyset_id()).await.unwrap(),
            Some(0)
        );
    }

    #[tokio::test]
    async fn increment_hands_out_contiguous_ranges() {
        let (service, _storage, _events) = service().await;

        let first = service.increment(&mint_url(), &keyset_id(), 3).await.unwrap();
        assert_eq!(first, CounterRange { start: 0, end: 3 });

        let second = service.increment(&mint_url(), &keyset_id(), 2).await.unwrap();
        assert_eq!(second, CounterRange { start: 3, end: 5 });
    }

    #[tokio::test]
    async fn increment_emits_counter_updated() {
        let (service, _storage, events) = service().await;
        let seen = Arc::new(AtomicU32::new(0));

        let seen_clone = seen.clone();
        events.on(EventKind::CounterUpdated, move |event| {
            let seen = seen_clone.clone();
            async move {
                if let WalletEvent::CounterUpdated { value, .. } = event {
                    seen.store(value, Ordering::SeqCst);
                }
                Ok(())
            }
        });

        service.increment(&mint_url(), &keyset_id(), 4).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn overwrite_never_lowers() {
        let (service, _storage, _events) = service().await;

        service.increment(&mint_url(), &keyset_id(), 10).await.unwrap();

        assert_eq!(
            service.overwrite(&mint_url(), &keyset_id(), 4).await.unwrap(),
            10
        );
        assert_eq!(
            service.overwrite(&mint_url(), &keyset_id(), 25).await.unwrap(),
            25
        );
        assert_eq!(service.get(&mint_url(), &keyset_id()).await.unwrap(), 25);
    }
}
