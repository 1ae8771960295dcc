//! Builder for [`WalletCore`].

use std::sync::Arc;

use satchel_common::database::WalletStorage;
use satchel_common::Error;

use crate::core::WalletCore;
use crate::transport::http::{HttpMintClient, MintClient, RateLimitConfig};
use crate::SeedProvider;

/// Builder for creating a new [`WalletCore`].
#[derive(Default)]
pub struct WalletCoreBuilder {
    storage: Option<Arc<dyn WalletStorage>>,
    seed: Option<SeedProvider>,
    client: Option<Arc<dyn MintClient>>,
    rate_limit: Option<RateLimitConfig>,
}

impl std::fmt::Debug for WalletCoreBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletCoreBuilder").finish_non_exhaustive()
    }
}

impl WalletCoreBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the storage backend.
    pub fn storage(mut self, storage: Arc<dyn WalletStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Set the seed provider callback.
    pub fn seed_provider(mut self, seed: SeedProvider) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Use a fixed 64-byte seed.
    pub fn seed(self, seed: [u8; 64]) -> Self {
        self.seed_provider(Arc::new(move || Ok(seed)))
    }

    /// Override the mint client (tests inject a fake mint here).
    pub fn client<C: MintClient + 'static>(mut self, client: C) -> Self {
        self.client = Some(Arc::new(client));
        self
    }

    /// Tune the HTTP rate limiter.
    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = Some(config);
        self
    }

    /// Build the core.
    pub fn build(self) -> Result<WalletCore, Error> {
        let storage = self
            .storage
            .ok_or_else(|| Error::Validation("storage backend is required".to_string()))?;
        let seed = self
            .seed
            .ok_or_else(|| Error::Validation("seed provider is required".to_string()))?;
        let client = self.client.unwrap_or_else(|| {
            Arc::new(HttpMintClient::new(self.rate_limit.unwrap_or_default()))
        });

        Ok(WalletCore::wire(storage, client, seed))
    }
}
