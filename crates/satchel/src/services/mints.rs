//! Mint lifecycle: adding, trusting, refreshing, keyset discovery.

use std::str::FromStr;
use std::sync::Arc;

use satchel_common::database::WalletStorage;
use satchel_common::keyset::KeysetRecord;
use satchel_common::mint::MintRecord;
use satchel_common::mint_url::MintUrl;
use satchel_common::{unix_time, Error};
use tracing::instrument;

use crate::events::{EventBus, WalletEvent};
use crate::transport::http::MintClient;

/// How long cached mint info and keysets stay fresh.
pub const MINT_INFO_TTL_SECS: u64 = 300;

/// Mint accessor.
#[derive(Debug, Clone)]
pub struct MintService {
    storage: Arc<dyn WalletStorage>,
    client: Arc<dyn MintClient>,
    events: Arc<EventBus>,
}

impl MintService {
    /// Create the service.
    pub fn new(
        storage: Arc<dyn WalletStorage>,
        client: Arc<dyn MintClient>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            storage,
            client,
            events,
        }
    }

    /// Add a mint by URL. Untrusted unless `trusted` is set.
    ///
    /// Info and keysets are fetched best-effort; a mint that is
    /// unreachable right now is still added and synced on first use.
    #[instrument(skip(self))]
    pub async fn add_mint(&self, url: &str, trusted: bool) -> Result<MintRecord, Error> {
        let mint_url = MintUrl::from_str(url)?;

        if let Some(existing) = self.storage.get_mint(&mint_url).await? {
            return Ok(existing);
        }

        let info = match self.client.get_mint_info(&mint_url).await {
            Ok(info) => Some(info),
            Err(err) => {
                tracing::warn!(%mint_url, "could not fetch mint info: {err}");
                None
            }
        };

        let mut record = MintRecord::new(mint_url.clone(), info);
        record.trusted = trusted;

        let mut tx = self.storage.begin_transaction().await?;
        tx.add_mint(record.clone()).await?;
        tx.commit().await?;

        self.events
            .emit(WalletEvent::MintAdded {
                mint_url: mint_url.clone(),
            })
            .await;

        if let Err(err) = self.sync_keysets(&mint_url).await {
            tracing::warn!(%mint_url, "initial keyset sync failed: {err}");
        }

        Ok(record)
    }

    /// Get a mint, failing for unknown URLs.
    pub async fn require_mint(&self, mint_url: &MintUrl) -> Result<MintRecord, Error> {
        self.storage
            .get_mint(mint_url)
            .await?
            .ok_or_else(|| Error::UnknownMint(mint_url.clone()))
    }

    /// Get a mint, failing unless the user trusts it.
    pub async fn require_trusted(&self, mint_url: &MintUrl) -> Result<MintRecord, Error> {
        let record = self.require_mint(mint_url).await?;
        if !record.trusted {
            return Err(Error::UntrustedMint(mint_url.clone()));
        }
        Ok(record)
    }

    /// Mark a mint as trusted.
    pub async fn trust_mint(&self, mint_url: &MintUrl) -> Result<(), Error> {
        let mut record = self.require_mint(mint_url).await?;
        if record.trusted {
            return Ok(());
        }
        record.trusted = true;

        let mut tx = self.storage.begin_transaction().await?;
        tx.add_mint(record).await?;
        tx.commit().await?;

        self.events
            .emit(WalletEvent::MintUpdated {
                mint_url: mint_url.clone(),
            })
            .await;
        Ok(())
    }

    /// Withdraw trust from a mint. Watchers cancel their
    /// subscriptions in response to the emitted event.
    pub async fn untrust_mint(&self, mint_url: &MintUrl) -> Result<(), Error> {
        let mut record = self.require_mint(mint_url).await?;
        if !record.trusted {
            return Ok(());
        }
        record.trusted = false;

        let mut tx = self.storage.begin_transaction().await?;
        tx.add_mint(record).await?;
        tx.commit().await?;

        self.events
            .emit(WalletEvent::MintUntrusted {
                mint_url: mint_url.clone(),
            })
            .await;
        Ok(())
    }

    /// Refresh cached info and keysets when older than the TTL.
    pub async fn ensure_fresh(&self, mint_url: &MintUrl) -> Result<(), Error> {
        let record = self.require_mint(mint_url).await?;
        if record.is_stale(MINT_INFO_TTL_SECS) {
            self.refresh_mint(mint_url).await?;
        }
        Ok(())
    }

    /// Fetch mint info and keysets, updating the local mirror.
    #[instrument(skip(self), fields(mint_url = %mint_url))]
    pub async fn refresh_mint(&self, mint_url: &MintUrl) -> Result<(), Error> {
        let mut record = self.require_mint(mint_url).await?;

        match self.client.get_mint_info(mint_url).await {
            Ok(info) => {
                record.name = info
                    .get("name")
                    .and_then(|name| name.as_str())
                    .map(str::to_string)
                    .or(record.name);
                record.info = Some(info);
            }
            Err(err) => return Err(Error::MintFetch(err.to_string())),
        }
        record.updated_at = unix_time();

        let mut tx = self.storage.begin_transaction().await?;
        tx.add_mint(record).await?;
        tx.commit().await?;

        self.sync_keysets(mint_url).await?;

        self.events
            .emit(WalletEvent::MintUpdated {
                mint_url: mint_url.clone(),
            })
            .await;

        Ok(())
    }

    /// Discover keysets and fetch key material for ones seen for the
    /// first time. Known keysets only follow the mint's `active` flag
    /// and fee; their keys are immutable.
    #[instrument(skip(self), fields(mint_url = %mint_url))]
    pub async fn sync_keysets(&self, mint_url: &MintUrl) -> Result<(), Error> {
        let entries = self
            .client
            .get_keysets(mint_url)
            .await
            .map_err(|err| Error::KeysetSync(err.to_string()))?;

        let mut records = Vec::with_capacity(entries.len());

        for entry in entries {
            let record = match self.storage.get_keyset(mint_url, &entry.id).await? {
                Some(mut known) => {
                    known.active = entry.active;
                    known.input_fee_ppk = entry.input_fee_ppk;
                    known
                }
                None => {
                    let keypairs = self
                        .client
                        .get_keyset_keys(mint_url, entry.id)
                        .await
                        .map_err(|err| Error::KeysetSync(err.to_string()))?;

                    KeysetRecord {
                        mint_url: mint_url.clone(),
                        id: entry.id,
                        unit: entry.unit,
                        active: entry.active,
                        input_fee_ppk: entry.input_fee_ppk,
                        keypairs: None,
                    }
                    .with_keypairs(keypairs)?
                }
            };
            records.push(record);
        }

        let mut tx = self.storage.begin_transaction().await?;
        tx.add_keysets(records).await?;
        tx.commit().await?;

        Ok(())
    }

    /// Remove a mint and its dependent keysets and counters.
    pub async fn remove_mint(&self, mint_url: &MintUrl) -> Result<(), Error> {
        let mut tx = self.storage.begin_transaction().await?;
        tx.remove_mint(mint_url).await?;
        tx.commit().await?;
        Ok(())
    }
}
