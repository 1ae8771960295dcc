//! Watches inflight proofs and auto-finalizes sends once the
//! recipient claims them.

use std::collections::HashMap;
use std::sync::Arc;

use cashu::nuts::nut07::State as MintProofState;
use satchel_common::database::WalletStorage;
use satchel_common::mint_url::MintUrl;
use satchel_common::operation::SendState;
use satchel_common::proof::ProofState;
use satchel_common::Error;
use tokio::sync::Mutex;
use tracing::instrument;
use uuid::Uuid;

use crate::events::{EventBus, EventKind, HandlerId, WalletEvent};
use crate::operations::SendSaga;
use crate::transport::ws::{
    NotificationCallback, NotificationPayload, SubscriptionKind, SubscriptionManager,
};

struct Inner {
    storage: Arc<dyn WalletStorage>,
    events: Arc<EventBus>,
    subscriptions: Arc<SubscriptionManager>,
    send_saga: Arc<SendSaga>,
    /// Hex-encoded Ys this watcher subscribed, per mint.
    watched: Mutex<HashMap<MintUrl, Vec<String>>>,
}

impl Inner {
    fn callback(self: &Arc<Self>, mint_url: MintUrl) -> NotificationCallback {
        let inner = self.clone();
        Arc::new(move |payload| {
            let inner = inner.clone();
            let mint_url = mint_url.clone();
            Box::pin(async move {
                if let NotificationPayload::ProofState(proof_state) = payload {
                    if proof_state.state == MintProofState::Spent {
                        inner.on_spent(&mint_url, proof_state.y.to_hex()).await?;
                    }
                }
                Ok(())
            })
        })
    }

    /// A watched Y was spent at the mint: settle the local proof and
    /// try to auto-finalize the operation holding it.
    async fn on_spent(self: &Arc<Self>, mint_url: &MintUrl, y_hex: String) -> Result<(), Error> {
        let proofs = self.storage.get_proofs(mint_url).await?;
        let Some(record) = proofs
            .iter()
            .find(|record| record.y.to_hex() == y_hex)
            .cloned()
        else {
            tracing::debug!(%mint_url, y = %y_hex, "spent notification for unknown proof");
            return Ok(());
        };

        if record.state != ProofState::Spent {
            let secrets = vec![record.secret().clone()];
            let mut tx = self.storage.begin_transaction().await?;
            tx.set_proof_state(mint_url, &secrets, ProofState::Spent)
                .await?;
            tx.commit().await?;

            self.events
                .emit(WalletEvent::ProofsStateChanged {
                    mint_url: mint_url.clone(),
                    secrets,
                    state: ProofState::Spent,
                })
                .await;
        }

        let operation_id = record
            .used_by_operation
            .or(record.created_by_operation);
        if let Some(operation_id) = operation_id {
            self.try_finalize_send(mint_url, operation_id).await?;
        }

        Ok(())
    }

    /// Finalize a pending send once every one of its send proofs is
    /// locally spent.
    async fn try_finalize_send(
        self: &Arc<Self>,
        mint_url: &MintUrl,
        operation_id: Uuid,
    ) -> Result<(), Error> {
        let Some(operation) = self.storage.get_send_operation(operation_id).await? else {
            return Ok(());
        };
        let SendState::Pending(pending) = &operation.state else {
            return Ok(());
        };

        let send_secrets: Vec<_> = pending
            .token
            .proofs
            .iter()
            .map(|proof| proof.secret.clone())
            .collect();
        let records = self
            .storage
            .get_proofs_by_secrets(mint_url, &send_secrets)
            .await?;

        let all_spent = records.len() == send_secrets.len()
            && records.iter().all(|record| record.state == ProofState::Spent);

        if all_spent {
            self.send_saga.finalize(operation_id).await?;
        }

        Ok(())
    }

    async fn watch(self: &Arc<Self>, mint_url: &MintUrl, ys: Vec<String>) {
        if ys.is_empty() {
            return;
        }

        // Only trusted mints get a socket.
        match self.storage.get_mint(mint_url).await {
            Ok(Some(mint)) if mint.trusted => {}
            _ => return,
        }

        if let Err(err) = self
            .subscriptions
            .subscribe(
                mint_url,
                SubscriptionKind::ProofState,
                ys.clone(),
                self.callback(mint_url.clone()),
            )
            .await
        {
            tracing::warn!(%mint_url, "could not subscribe to proof states: {err}");
            return;
        }

        self.watched
            .lock()
            .await
            .entry(mint_url.clone())
            .or_default()
            .extend(ys);
    }

    async fn unwatch(self: &Arc<Self>, mint_url: &MintUrl, ys: Vec<String>) {
        if ys.is_empty() {
            return;
        }
        if let Err(err) = self
            .subscriptions
            .unsubscribe(mint_url, SubscriptionKind::ProofState, &ys)
            .await
        {
            tracing::warn!(%mint_url, "unsubscribing proof states failed: {err}");
        }
        if let Some(watched) = self.watched.lock().await.get_mut(mint_url) {
            watched.retain(|y| !ys.contains(y));
        }
    }

    async fn ys_for_secrets(
        &self,
        mint_url: &MintUrl,
        secrets: &[cashu::secret::Secret],
    ) -> Result<Vec<String>, Error> {
        let records = self
            .storage
            .get_proofs_by_secrets(mint_url, secrets)
            .await?;
        Ok(records.iter().map(|record| record.y.to_hex()).collect())
    }
}

/// Subscribes to proof-state notifications for inflight proofs and
/// settles them as the mint reports spends.
pub struct ProofStateWatcher {
    inner: Arc<Inner>,
    handlers: Mutex<Vec<HandlerId>>,
}

impl std::fmt::Debug for ProofStateWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProofStateWatcher").finish_non_exhaustive()
    }
}

impl ProofStateWatcher {
    /// Create the watcher.
    pub fn new(
        storage: Arc<dyn WalletStorage>,
        events: Arc<EventBus>,
        subscriptions: Arc<SubscriptionManager>,
        send_saga: Arc<SendSaga>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                storage,
                events,
                subscriptions,
                send_saga,
                watched: Mutex::new(HashMap::new()),
            }),
            handlers: Mutex::new(Vec::new()),
        }
    }

    /// Watch already-inflight proofs and react to state changes.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), Error> {
        let inflight = self.inner.storage.get_inflight_proofs().await?;
        let mut by_mint: HashMap<MintUrl, Vec<String>> = HashMap::new();
        for record in inflight {
            by_mint
                .entry(record.mint_url.clone())
                .or_default()
                .push(record.y.to_hex());
        }
        for (mint_url, ys) in by_mint {
            self.inner.watch(&mint_url, ys).await;
        }

        let mut handlers = self.handlers.lock().await;

        let watcher = self.inner.clone();
        handlers.push(self.inner.events.on(
            EventKind::ProofsStateChanged,
            move |event| {
                let watcher = watcher.clone();
                async move {
                    let WalletEvent::ProofsStateChanged {
                        mint_url,
                        secrets,
                        state,
                    } = event
                    else {
                        return Ok(());
                    };

                    match state {
                        ProofState::Inflight => {
                            let ys = watcher.ys_for_secrets(&mint_url, &secrets).await?;
                            watcher.watch(&mint_url, ys).await;
                        }
                        ProofState::Spent => {
                            let ys = watcher.ys_for_secrets(&mint_url, &secrets).await?;
                            watcher.unwatch(&mint_url, ys).await;
                        }
                        ProofState::Ready => {}
                    }
                    Ok(())
                }
            },
        ));

        let watcher = self.inner.clone();
        handlers.push(
            self.inner
                .events
                .on(EventKind::MintUntrusted, move |event| {
                    let watcher = watcher.clone();
                    async move {
                        if let WalletEvent::MintUntrusted { mint_url } = event {
                            watcher.subscriptions.stop_mint(&mint_url).await;
                            watcher.watched.lock().await.remove(&mint_url);
                        }
                        Ok(())
                    }
                }),
        );

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
            watched.drain().collect()
        };
        for (mint_url, ys) in watched {
            if let Err(err) = self
                .inner
                .subscriptions
                .unsubscribe(&mint_url, SubscriptionKind::ProofState, &ys)
                .await
            {
                tracing::warn!(%mint_url, "unsubscribing proof states failed: {err}");
            }
        }
    }

    /// Tear down and rebuild the subscriptions.
    pub async fn resume(&self) -> Result<(), Error> {
        self.stop().await;
        self.start().await
    }
}
