//! Mint records.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::mint_url::MintUrl;
use crate::unix_time;

/// A mint known to this wallet.
///
/// The normalized URL is the primary key; every dependent row (keysets,
/// counters, proofs, quotes) references it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintRecord {
    /// Normalized mint URL
    pub mint_url: MintUrl,
    /// Human readable name, taken from mint info when available
    pub name: Option<String>,
    /// Cached `/v1/info` blob; opaque to the core
    pub info: Option<Value>,
    /// Whether the user trusts this mint for sends and receives
    pub trusted: bool,
    /// Unix seconds the mint was first added
    pub created_at: u64,
    /// Unix seconds of the last info/keyset refresh
    pub updated_at: u64,
}

impl MintRecord {
    /// Create a new, untrusted mint record.
    pub fn new(mint_url: MintUrl, info: Option<Value>) -> Self {
        let now = unix_time();
        let name = info
            .as_ref()
            .and_then(|blob| blob.get("name"))
            .and_then(|name| name.as_str())
            .map(str::to_string);

        Self {
            mint_url,
            name,
            info,
            trusted: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the cached info is older than the given TTL.
    pub fn is_stale(&self, ttl_secs: u64) -> bool {
        unix_time().saturating_sub(self.updated_at) >= ttl_secs
    }
}
