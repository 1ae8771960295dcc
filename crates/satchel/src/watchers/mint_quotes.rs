//! Watches unsettled mint quotes and redeems them when paid.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use satchel_common::database::WalletStorage;
use satchel_common::mint_url::MintUrl;
use satchel_common::quotes::MintQuoteState;
use satchel_common::Error;
use tokio::sync::Mutex;
use tracing::instrument;

use crate::events::{EventBus, EventKind, HandlerId, WalletEvent};
use crate::services::IssueService;
use crate::transport::ws::{
    NotificationCallback, NotificationPayload, SubscriptionKind, SubscriptionManager,
};

struct Inner {
    storage: Arc<dyn WalletStorage>,
    events: Arc<EventBus>,
    subscriptions: Arc<SubscriptionManager>,
    issue: Arc<IssueService>,
    /// Quotes currently being redeemed, to deduplicate notifications.
    redeeming: Mutex<HashSet<String>>,
    /// Quote ids this watcher subscribed, per mint.
    watched: Mutex<HashMap<MintUrl, HashSet<String>>>,
}

impl Inner {
    fn callback(self: &Arc<Self>, mint_url: MintUrl) -> NotificationCallback {
        let inner = self.clone();
        Arc::new(move |payload| {
            let inner = inner.clone();
            let mint_url = mint_url.clone();
            Box::pin(async move {
                if let NotificationPayload::MintQuote(quote) = payload {
                    inner.on_quote_update(&mint_url, &quote.quote, quote.state).await?;
                }
                Ok(())
            })
        })
    }

    async fn on_quote_update(
        self: &Arc<Self>,
        mint_url: &MintUrl,
        quote_id: &str,
        state: MintQuoteState,
    ) -> Result<(), Error> {
        self.issue.update_quote_state(mint_url, quote_id, state).await?;

        match state {
            MintQuoteState::Paid => {
                {
                    let mut redeeming = self.redeeming.lock().await;
                    if !redeeming.insert(quote_id.to_string()) {
                        return Ok(());
                    }
                }

                let result = self.issue.redeem(mint_url, quote_id).await;
                self.redeeming.lock().await.remove(quote_id);

                match result {
                    Ok(_) => {
                        self.unwatch(mint_url, quote_id).await?;
                    }
                    Err(err) => {
                        // Keep watching; a later notification or a
                        // manual redeem can still settle the quote.
                        tracing::warn!(quote_id, "redeeming paid quote failed: {err}");
                    }
                }
            }
            MintQuoteState::Issued => {
                self.unwatch(mint_url, quote_id).await?;
            }
            MintQuoteState::Unpaid => {}
        }

        Ok(())
    }

    async fn unwatch(self: &Arc<Self>, mint_url: &MintUrl, quote_id: &str) -> Result<(), Error> {
        self.subscriptions
            .unsubscribe(
                mint_url,
                SubscriptionKind::Bolt11MintQuote,
                &[quote_id.to_string()],
            )
            .await?;
        if let Some(watched) = self.watched.lock().await.get_mut(mint_url) {
            watched.remove(quote_id);
        }
        Ok(())
    }

    async fn watch(self: &Arc<Self>, mint_url: &MintUrl, quote_ids: Vec<String>) {
        if quote_ids.is_empty() {
            return;
        }
        if let Err(err) = self
            .subscriptions
            .subscribe(
                mint_url,
                SubscriptionKind::Bolt11MintQuote,
                quote_ids.clone(),
                self.callback(mint_url.clone()),
            )
            .await
        {
            tracing::warn!(%mint_url, "could not subscribe to mint quotes: {err}");
            return;
        }
        self.watched
            .lock()
            .await
            .entry(mint_url.clone())
            .or_default()
            .extend(quote_ids);
    }
}

/// Watches bolt11 mint quotes over the mint's notification socket and
/// redeems them as soon as they are paid.
pub struct MintQuoteWatcher {
    inner: Arc<Inner>,
    handlers: Mutex<Vec<HandlerId>>,
}

impl std::fmt::Debug for MintQuoteWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MintQuoteWatcher").finish_non_exhaustive()
    }
}

impl MintQuoteWatcher {
    /// Create the watcher.
    pub fn new(
        storage: Arc<dyn WalletStorage>,
        events: Arc<EventBus>,
        subscriptions: Arc<SubscriptionManager>,
        issue: Arc<IssueService>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                storage,
                events,
                subscriptions,
                issue,
                redeeming: Mutex::new(HashSet::new()),
                watched: Mutex::new(HashMap::new()),
            }),
            handlers: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to every unsettled quote and to quotes created later.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), Error> {
        let pending = self.inner.storage.get_pending_mint_quotes().await?;

        let mut by_mint: HashMap<MintUrl, Vec<String>> = HashMap::new();
        for quote in pending {
            by_mint.entry(quote.mint_url).or_default().push(quote.id);
        }
        for (mint_url, quote_ids) in by_mint {
            self.inner.watch(&mint_url, quote_ids).await;
        }

        let watcher = self.inner.clone();
        let handler = self
            .inner
            .events
            .on(EventKind::MintQuoteCreated, move |event| {
                let watcher = watcher.clone();
                async move {
                    if let WalletEvent::MintQuoteCreated { quote } = event {
                        watcher.watch(&quote.mint_url, vec![quote.id]).await;
                    }
                    Ok(())
                }
            });
        self.handlers.lock().await.push(handler);

        Ok(())
    }

    /// Unsubscribe everything and drop the bus handlers. Idempotent.
    pub async fn stop(&self) {
        let mut handlers = self.handlers.lock().await;
        for handler in handlers.drain(..) {
            self.inner.events.off(handler);
        }
        drop(handlers);

        let watched: Vec<(MintUrl, Vec<String>)> = {
            let mut watched = self.inner.watched.lock().await;
            watched
                .drain()
                .map(|(mint_url, quote_ids)| (mint_url, quote_ids.into_iter().collect()))
                .collect()
        };
        for (mint_url, quote_ids) in watched {
            if let Err(err) = self
                .inner
                .subscriptions
                .unsubscribe(&mint_url, SubscriptionKind::Bolt11MintQuote, &quote_ids)
                .await
            {
                tracing::warn!(%mint_url, "unsubscribing mint quotes failed: {err}");
            }
        }
    }

    /// Tear down and rebuild the subscriptions.
    pub async fn resume(&self) -> Result<(), Error> {
        self.stop().await;
        self.start().await
    }
}
