//! Rate-limited mint HTTP client.
//!
//! One token bucket per mint. Tokens refill continuously; a request
//! that finds the bucket empty parks in a FIFO queue until enough
//! refill accumulated. Requests whose path starts with a bypass prefix
//! skip the bucket entirely and may overtake queued requests on the
//! wire; only rate-limited requests are FIFO-ordered.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cashu::nuts::nut07::ProofState;
use cashu::nuts::{
    BlindSignature, BlindedMessage, CheckStateRequest, CheckStateResponse, CurrencyUnit, Id,
    Proofs, PublicKey, RestoreRequest, RestoreResponse, SwapRequest, SwapResponse,
};
use cashu::Amount;
use satchel_common::mint_url::MintUrl;
use satchel_common::quotes::{MeltQuoteState, MintQuoteState};
use satchel_common::Error;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::instrument;

/// One entry of `GET /v1/keysets`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysetEntry {
    /// Keyset id
    pub id: Id,
    /// Currency unit
    pub unit: CurrencyUnit,
    /// Whether the mint signs with this keyset
    pub active: bool,
    /// Input fee in parts-per-thousand
    #[serde(default)]
    pub input_fee_ppk: u64,
}

#[derive(Debug, Deserialize)]
struct KeysetsResponse {
    keysets: Vec<KeysetEntry>,
}

#[derive(Debug, Deserialize)]
struct KeysEntry {
    #[allow(dead_code)]
    id: Id,
    keys: BTreeMap<u64, PublicKey>,
}

#[derive(Debug, Deserialize)]
struct KeysResponse {
    keysets: Vec<KeysEntry>,
}

#[derive(Debug, Serialize)]
struct MintQuoteRequest {
    amount: Amount,
    unit: CurrencyUnit,
}

/// Mint-side view of a bolt11 mint quote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MintQuoteResponse {
    /// Quote id
    pub quote: String,
    /// bolt11 payment request
    pub request: String,
    /// Quote state
    pub state: MintQuoteState,
    /// Expiry, unix seconds
    #[serde(default)]
    pub expiry: u64,
}

#[derive(Debug, Serialize)]
struct MintRequest {
    quote: String,
    outputs: Vec<BlindedMessage>,
}

#[derive(Debug, Deserialize)]
struct MintResponse {
    signatures: Vec<BlindSignature>,
}

#[derive(Debug, Serialize)]
struct MeltQuoteRequest {
    request: String,
    unit: CurrencyUnit,
}

/// Mint-side view of a bolt11 melt quote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeltQuoteResponse {
    /// Quote id
    pub quote: String,
    /// Invoice amount
    pub amount: Amount,
    /// Lightning fee reserve
    pub fee_reserve: Amount,
    /// Quote state
    pub state: MeltQuoteState,
    /// Expiry, unix seconds
    #[serde(default)]
    pub expiry: u64,
    /// Preimage once paid
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_preimage: Option<String>,
    /// Signatures over the blank change outputs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change: Option<Vec<BlindSignature>>,
}

#[derive(Debug, Serialize)]
struct MeltRequest {
    quote: String,
    inputs: Proofs,
    #[serde(skip_serializing_if = "Option::is_none")]
    outputs: Option<Vec<BlindedMessage>>,
}

/// Mint protocol error body, surfaced from HTTP 400 responses.
#[derive(Debug, Clone, Deserialize)]
struct ErrorBody {
    code: i64,
    detail: String,
}

/// The seam between the core and a mint.
///
/// The production implementation is [`HttpMintClient`]; tests inject a
/// fake mint.
#[async_trait]
pub trait MintClient: Debug + Send + Sync {
    /// `GET /v1/info`. The blob is opaque to the core.
    async fn get_mint_info(&self, mint_url: &MintUrl) -> Result<Value, Error>;

    /// `GET /v1/keysets`
    async fn get_keysets(&self, mint_url: &MintUrl) -> Result<Vec<KeysetEntry>, Error>;

    /// `GET /v1/keys/{id}`
    async fn get_keyset_keys(
        &self,
        mint_url: &MintUrl,
        keyset_id: Id,
    ) -> Result<BTreeMap<u64, PublicKey>, Error>;

    /// `POST /v1/mint/quote/bolt11`
    async fn create_mint_quote(
        &self,
        mint_url: &MintUrl,
        amount: Amount,
        unit: CurrencyUnit,
    ) -> Result<MintQuoteResponse, Error>;

    /// `GET /v1/mint/quote/bolt11/{quote_id}`
    async fn get_mint_quote(
        &self,
        mint_url: &MintUrl,
        quote_id: &str,
    ) -> Result<MintQuoteResponse, Error>;

    /// `POST /v1/mint/bolt11`
    async fn mint(
        &self,
        mint_url: &MintUrl,
        quote_id: &str,
        outputs: Vec<BlindedMessage>,
    ) -> Result<Vec<BlindSignature>, Error>;

    /// `POST /v1/melt/quote/bolt11`
    async fn create_melt_quote(
        &self,
        mint_url: &MintUrl,
        request: String,
        unit: CurrencyUnit,
    ) -> Result<MeltQuoteResponse, Error>;

    /// `GET /v1/melt/quote/bolt11/{quote_id}`
    async fn get_melt_quote(
        &self,
        mint_url: &MintUrl,
        quote_id: &str,
    ) -> Result<MeltQuoteResponse, Error>;

    /// `POST /v1/melt/bolt11`
    async fn melt(
        &self,
        mint_url: &MintUrl,
        quote_id: &str,
        inputs: Proofs,
        outputs: Vec<BlindedMessage>,
    ) -> Result<MeltQuoteResponse, Error>;

    /// `POST /v1/swap`
    async fn swap(&self, mint_url: &MintUrl, request: SwapRequest) -> Result<SwapResponse, Error>;

    /// `POST /v1/checkstate`
    async fn check_state(
        &self,
        mint_url: &MintUrl,
        ys: Vec<PublicKey>,
    ) -> Result<Vec<ProofState>, Error>;

    /// `POST /v1/restore`
    async fn restore(
        &self,
        mint_url: &MintUrl,
        outputs: Vec<BlindedMessage>,
    ) -> Result<RestoreResponse, Error>;
}

/// Rate limiter settings.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Bucket capacity
    pub capacity: u32,
    /// Tokens refilled per minute
    pub refill_per_minute: u32,
    /// Path prefixes that skip the bucket
    pub bypass_prefixes: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 20,
            refill_per_minute: 60,
            bypass_prefixes: vec![
                "/v1/info".to_string(),
                "/v1/keys".to_string(),
                "/v1/keysets".to_string(),
            ],
        }
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Per-mint token bucket. Waiters queue FIFO on the fair mutex.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_minute: f64,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    fn new(capacity: u32, refill_per_minute: u32) -> Self {
        Self {
            capacity: capacity as f64,
            refill_per_minute: refill_per_minute as f64,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let elapsed_ms = state.last_refill.elapsed().as_millis() as f64;
        state.last_refill = Instant::now();
        state.tokens =
            (state.tokens + elapsed_ms * self.refill_per_minute / 60_000.0).min(self.capacity);
    }

    /// Take one token, parking until refill makes one available.
    pub async fn acquire(&self) {
        let mut state = self.state.lock().await;
        loop {
            self.refill(&mut state);
            if state.tokens >= 1.0 {
                state.tokens -= 1.0;
                return;
            }
            let rate_per_ms = self.refill_per_minute / 60_000.0;
            let wait_ms = ((1.0 - state.tokens) / rate_per_ms).ceil() as u64;
            tokio::time::sleep(Duration::from_millis(wait_ms)).await;
        }
    }
}

/// Rate-limited HTTP implementation of [`MintClient`].
#[derive(Debug, Clone)]
pub struct HttpMintClient {
    client: reqwest::Client,
    config: RateLimitConfig,
    limiters: Arc<Mutex<HashMap<MintUrl, Arc<RateLimiter>>>>,
}

impl Default for HttpMintClient {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

impl HttpMintClient {
    /// Create a new client.
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            limiters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn limiter(&self, mint_url: &MintUrl) -> Arc<RateLimiter> {
        let mut limiters = self.limiters.lock().await;
        limiters
            .entry(mint_url.clone())
            .or_insert_with(|| {
                Arc::new(RateLimiter::new(
                    self.config.capacity,
                    self.config.refill_per_minute,
                ))
            })
            .clone()
    }

    fn is_bypass(&self, path_elements: &[&str]) -> bool {
        let path = format!("/{}", path_elements.join("/"));
        self.config
            .bypass_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    async fn request<T: DeserializeOwned>(
        &self,
        mint_url: &MintUrl,
        path_elements: &[&str],
        body: Option<Value>,
    ) -> Result<T, Error> {
        if !self.is_bypass(path_elements) {
            self.limiter(mint_url).await.acquire().await;
        }

        let url = mint_url.join_paths(path_elements)?;

        let request = match &body {
            Some(json) => self.client.post(url).json(json),
            None => self.client.get(url),
        };

        let response = request
            .header("Accept", "application/json, text/plain, */*")
            .send()
            .await
            .map_err(|err| Error::Network(err.to_string()))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|err| Error::Network(err.to_string()))?;

        if !(200..300).contains(&status) {
            if let Ok(ErrorBody { code, detail }) = serde_json::from_str::<ErrorBody>(&text) {
                return Err(Error::MintOperation {
                    code,
                    detail,
                    status,
                });
            }
            return Err(Error::HttpResponse {
                status,
                message: text.chars().take(256).collect(),
            });
        }

        let value: Value = serde_json::from_str(&text)
            .map_err(|err| Error::HttpResponse {
                status,
                message: format!("invalid JSON body: {err}"),
            })?;

        match serde_json::from_value::<T>(value.clone()) {
            Ok(parsed) => Ok(parsed),
            Err(err) => {
                tracing::warn!(%mint_url, "unexpected mint response shape: {err}");
                if let Ok(ErrorBody { code, detail }) = serde_json::from_value::<ErrorBody>(value) {
                    return Err(Error::MintOperation {
                        code,
                        detail,
                        status,
                    });
                }
                Err(Error::HttpResponse {
                    status,
                    message: err.to_string(),
                })
            }
        }
    }

    async fn post<T: DeserializeOwned>(
        &self,
        mint_url: &MintUrl,
        path_elements: &[&str],
        body: impl Serialize,
    ) -> Result<T, Error> {
        let json = serde_json::to_value(body)?;
        self.request(mint_url, path_elements, Some(json)).await
    }

    async fn get<T: DeserializeOwned>(
        &self,
        mint_url: &MintUrl,
        path_elements: &[&str],
    ) -> Result<T, Error> {
        self.request(mint_url, path_elements, None).await
    }
}

#[async_trait]
impl MintClient for HttpMintClient {
    #[instrument(skip(self), fields(mint_url = %mint_url))]
    async fn get_mint_info(&self, mint_url: &MintUrl) -> Result<Value, Error> {
        self.get(mint_url, &["v1", "info"]).await
    }

    #[instrument(skip(self), fields(mint_url = %mint_url))]
    async fn get_keysets(&self, mint_url: &MintUrl) -> Result<Vec<KeysetEntry>, Error> {
        let response: KeysetsResponse = self.get(mint_url, &["v1", "keysets"]).await?;
        Ok(response.keysets)
    }

    #[instrument(skip(self), fields(mint_url = %mint_url))]
    async fn get_keyset_keys(
        &self,
        mint_url: &MintUrl,
        keyset_id: Id,
    ) -> Result<BTreeMap<u64, PublicKey>, Error> {
        let response: KeysResponse = self
            .get(mint_url, &["v1", "keys", &keyset_id.to_string()])
            .await?;
        response
            .keysets
            .into_iter()
            .next()
            .map(|entry| entry.keys)
            .ok_or_else(|| Error::KeysetSync(format!("mint returned no keys for {keyset_id}")))
    }

    #[instrument(skip(self), fields(mint_url = %mint_url))]
    async fn create_mint_quote(
        &self,
        mint_url: &MintUrl,
        amount: Amount,
        unit: CurrencyUnit,
    ) -> Result<MintQuoteResponse, Error> {
        self.post(
            mint_url,
            &["v1", "mint", "quote", "bolt11"],
            MintQuoteRequest { amount, unit },
        )
        .await
    }

    #[instrument(skip(self, quote_id), fields(mint_url = %mint_url))]
    async fn get_mint_quote(
        &self,
        mint_url: &MintUrl,
        quote_id: &str,
    ) -> Result<MintQuoteResponse, Error> {
        self.get(mint_url, &["v1", "mint", "quote", "bolt11", quote_id])
            .await
    }

    #[instrument(skip_all, fields(mint_url = %mint_url))]
    async fn mint(
        &self,
        mint_url: &MintUrl,
        quote_id: &str,
        outputs: Vec<BlindedMessage>,
    ) -> Result<Vec<BlindSignature>, Error> {
        let response: MintResponse = self
            .post(
                mint_url,
                &["v1", "mint", "bolt11"],
                MintRequest {
                    quote: quote_id.to_string(),
                    outputs,
                },
            )
            .await?;
        Ok(response.signatures)
    }

    #[instrument(skip(self, request), fields(mint_url = %mint_url))]
    async fn create_melt_quote(
        &self,
        mint_url: &MintUrl,
        request: String,
        unit: CurrencyUnit,
    ) -> Result<MeltQuoteResponse, Error> {
        self.post(
            mint_url,
            &["v1", "melt", "quote", "bolt11"],
            MeltQuoteRequest { request, unit },
        )
        .await
    }

    #[instrument(skip(self, quote_id), fields(mint_url = %mint_url))]
    async fn get_melt_quote(
        &self,
        mint_url: &MintUrl,
        quote_id: &str,
    ) -> Result<MeltQuoteResponse, Error> {
        self.get(mint_url, &["v1", "melt", "quote", "bolt11", quote_id])
            .await
    }

    #[instrument(skip_all, fields(mint_url = %mint_url))]
    async fn melt(
        &self,
        mint_url: &MintUrl,
        quote_id: &str,
        inputs: Proofs,
        outputs: Vec<BlindedMessage>,
    ) -> Result<MeltQuoteResponse, Error> {
        let outputs = (!outputs.is_empty()).then_some(outputs);
        self.post(
            mint_url,
            &["v1", "melt", "bolt11"],
            MeltRequest {
                quote: quote_id.to_string(),
                inputs,
                outputs,
            },
        )
        .await
    }

    #[instrument(skip_all, fields(mint_url = %mint_url))]
    async fn swap(&self, mint_url: &MintUrl, request: SwapRequest) -> Result<SwapResponse, Error> {
        self.post(mint_url, &["v1", "swap"], request).await
    }

    #[instrument(skip_all, fields(mint_url = %mint_url))]
    async fn check_state(
        &self,
        mint_url: &MintUrl,
        ys: Vec<PublicKey>,
    ) -> Result<Vec<ProofState>, Error> {
        let response: CheckStateResponse = self
            .post(mint_url, &["v1", "checkstate"], CheckStateRequest { ys })
            .await?;
        Ok(response.states)
    }

    #[instrument(skip_all, fields(mint_url = %mint_url))]
    async fn restore(
        &self,
        mint_url: &MintUrl,
        outputs: Vec<BlindedMessage>,
    ) -> Result<RestoreResponse, Error> {
        self.post(mint_url, &["v1", "restore"], RestoreRequest { outputs })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn bucket_allows_burst_up_to_capacity() {
        let limiter = RateLimiter::new(5, 60);
        let started = Instant::now();

        for _ in 0..5 {
            limiter.acquire().await;
        }

        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_bucket_waits_for_refill() {
        let limiter = RateLimiter::new(1, 60);
        let started = Instant::now();

        limiter.acquire().await;
        limiter.acquire().await;

        // One token per second at 60/min.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(999), "elapsed {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(1100), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn refill_caps_at_capacity() {
        let limiter = RateLimiter::new(2, 60);

        limiter.acquire().await;
        limiter.acquire().await;

        // A long idle period must not accumulate more than `capacity`.
        tokio::time::sleep(Duration::from_secs(600)).await;

        let started = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(started.elapsed(), Duration::ZERO);

        let started = Instant::now();
        limiter.acquire().await;
        assert!(started.elapsed() >= Duration::from_millis(999));
    }

    #[tokio::test(start_paused = true)]
    async fn queued_requests_complete_in_fifo_order() {
        let limiter = Arc::new(RateLimiter::new(1, 60));
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        limiter.acquire().await;

        let mut handles = Vec::new();
        for tag in 0..3 {
            let limiter = limiter.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire().await;
                order.lock().unwrap().push(tag);
            }));
            // Deterministic enqueue order.
            tokio::task::yield_now().await;
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn bypass_prefixes_match_path_starts() {
        let client = HttpMintClient::default();
        assert!(client.is_bypass(&["v1", "info"]));
        assert!(client.is_bypass(&["v1", "keys", "00916bbf7ef91a36"]));
        assert!(client.is_bypass(&["v1", "keysets"]));
        assert!(!client.is_bypass(&["v1", "swap"]));
        assert!(!client.is_bypass(&["v1", "melt", "bolt11"]));
    }

    #[test]
    fn error_body_parses_mint_errors() {
        let body: ErrorBody =
            serde_json::from_str(r#"{"code": 11001, "detail": "Token already spent"}"#).unwrap();
        assert_eq!(body.code, 11001);
        assert_eq!(body.detail, "Token already spent");
    }
}
