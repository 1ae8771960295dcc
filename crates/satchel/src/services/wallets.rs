//! Per-(mint, unit) wallet cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use satchel_common::database::WalletStorage;
use satchel_common::mint_url::MintUrl;
use satchel_common::{CurrencyUnit, Error};
use tokio::sync::Mutex;

use super::mints::MintService;
use crate::wallet::Wallet;

/// How long a built wallet stays cached.
const WALLET_TTL: Duration = Duration::from_secs(300);

type WalletKey = (MintUrl, CurrencyUnit);

struct CachedWallet {
    wallet: Arc<Wallet>,
    built_at: Instant,
}

/// Builds and caches [`Wallet`] objects from persisted keysets.
pub struct WalletService {
    storage: Arc<dyn WalletStorage>,
    mints: Arc<MintService>,
    cache: Mutex<HashMap<WalletKey, CachedWallet>>,
    /// Per-key build locks so concurrent `get_wallet` calls share one
    /// build instead of racing the mint.
    builds: Mutex<HashMap<WalletKey, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for WalletService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletService").finish_non_exhaustive()
    }
}

impl WalletService {
    /// Create the service.
    pub fn new(storage: Arc<dyn WalletStorage>, mints: Arc<MintService>) -> Self {
        Self {
            storage,
            mints,
            cache: Mutex::new(HashMap::new()),
            builds: Mutex::new(HashMap::new()),
        }
    }

    /// Cached wallet for `(mint, unit)`, building one when missing or
    /// stale.
    pub async fn get_wallet(
        &self,
        mint_url: &MintUrl,
        unit: &CurrencyUnit,
    ) -> Result<Arc<Wallet>, Error> {
        let key = (mint_url.clone(), unit.clone());

        if let Some(wallet) = self.cached(&key).await {
            return Ok(wallet);
        }

        let build_lock = {
            let mut builds = self.builds.lock().await;
            builds.entry(key.clone()).or_default().clone()
        };
        let _guard = build_lock.lock().await;

        // Another caller may have finished the build while we waited.
        if let Some(wallet) = self.cached(&key).await {
            return Ok(wallet);
        }

        let wallet = Arc::new(self.build(mint_url, unit).await?);
        self.cache.lock().await.insert(
            key,
            CachedWallet {
                wallet: wallet.clone(),
                built_at: Instant::now(),
            },
        );

        Ok(wallet)
    }

    /// Drop the cached wallets of a mint, forcing a rebuild.
    pub async fn invalidate(&self, mint_url: &MintUrl) {
        let mut cache = self.cache.lock().await;
        cache.retain(|(mint, _), _| mint != mint_url);
    }

    async fn cached(&self, key: &WalletKey) -> Option<Arc<Wallet>> {
        let cache = self.cache.lock().await;
        cache.get(key).and_then(|entry| {
            (entry.built_at.elapsed() < WALLET_TTL).then(|| entry.wallet.clone())
        })
    }

    async fn build(&self, mint_url: &MintUrl, unit: &CurrencyUnit) -> Result<Wallet, Error> {
        self.mints.ensure_fresh(mint_url).await?;
        let keysets = self.storage.get_keysets(mint_url).await?;
        Wallet::new(mint_url.clone(), unit.clone(), keysets)
    }
}
