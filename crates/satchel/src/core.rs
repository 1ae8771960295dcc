//! The wallet core: wiring, lifecycle and the operation entry points.

use std::sync::Arc;

use cashu::Amount;
use satchel_common::database::WalletStorage;
use satchel_common::history::{HistoryEntry, HistoryKind};
use satchel_common::mint::MintRecord;
use satchel_common::mint_url::MintUrl;
use satchel_common::operation::{MeltOperation, SendMethod, SendOperation, SendState};
use satchel_common::proof::{ProofRecord, ProofState};
use satchel_common::quotes::{MeltQuote, MintQuote};
use satchel_common::token::ProofToken;
use satchel_common::{CurrencyUnit, Error, PublicKey};
use tracing::instrument;
use uuid::Uuid;

use crate::events::{EventBus, WalletEvent};
use crate::operations::recovery::RecoveryReport;
use crate::operations::{MeltSaga, RecoveryOrchestrator, SendSaga};
use crate::services::{
    CounterService, IssueService, MintService, ProofService, WalletService,
};
use crate::transport::http::MintClient;
use crate::transport::ws::SubscriptionManager;
use crate::watchers::{MintQuoteWatcher, ProofStateWatcher};
use crate::SeedProvider;

/// The assembled wallet core.
///
/// Owns the services, sagas and watchers; [`WalletCore::start`] runs
/// startup recovery and brings the watchers up.
pub struct WalletCore {
    storage: Arc<dyn WalletStorage>,
    client: Arc<dyn MintClient>,
    events: Arc<EventBus>,
    subscriptions: Arc<SubscriptionManager>,
    mints: Arc<MintService>,
    wallets: Arc<WalletService>,
    counters: Arc<CounterService>,
    proofs: Arc<ProofService>,
    issue: Arc<IssueService>,
    send_saga: Arc<SendSaga>,
    melt_saga: Arc<MeltSaga>,
    recovery: RecoveryOrchestrator,
    mint_quote_watcher: MintQuoteWatcher,
    proof_state_watcher: ProofStateWatcher,
}

impl std::fmt::Debug for WalletCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletCore").finish_non_exhaustive()
    }
}

impl WalletCore {
    pub(crate) fn wire(
        storage: Arc<dyn WalletStorage>,
        client: Arc<dyn MintClient>,
        seed: SeedProvider,
    ) -> Self {
        let events = Arc::new(EventBus::new());

        let subscriptions = Arc::new(SubscriptionManager::new());

        let mints = Arc::new(MintService::new(
            storage.clone(),
            client.clone(),
            events.clone(),
        ));
        let wallets = Arc::new(WalletService::new(storage.clone(), mints.clone()));
        let counters = Arc::new(CounterService::new(storage.clone(), events.clone()));
        let proofs = Arc::new(ProofService::new(
            storage.clone(),
            events.clone(),
            client.clone(),
            counters.clone(),
            wallets.clone(),
            seed,
        ));
        let issue = Arc::new(IssueService::new(
            storage.clone(),
            events.clone(),
            client.clone(),
            wallets.clone(),
            proofs.clone(),
        ));
        let send_saga = Arc::new(SendSaga::new(
            storage.clone(),
            events.clone(),
            client.clone(),
            wallets.clone(),
            proofs.clone(),
        ));
        let melt_saga = Arc::new(MeltSaga::new(
            storage.clone(),
            events.clone(),
            client.clone(),
            wallets.clone(),
            proofs.clone(),
        ));
        let recovery = RecoveryOrchestrator::new(
            storage.clone(),
            events.clone(),
            send_saga.clone(),
            melt_saga.clone(),
            proofs.clone(),
        );
        let mint_quote_watcher = MintQuoteWatcher::new(
            storage.clone(),
            events.clone(),
            subscriptions.clone(),
            issue.clone(),
        );
        let proof_state_watcher = ProofStateWatcher::new(
            storage.clone(),
            events.clone(),
            subscriptions.clone(),
            send_saga.clone(),
        );

        Self {
            storage,
            client,
            events,
            subscriptions,
            mints,
            wallets,
            counters,
            proofs,
            issue,
            send_saga,
            melt_saga,
            recovery,
            mint_quote_watcher,
            proof_state_watcher,
        }
    }

    /// Run startup recovery, then bring the watchers up.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<RecoveryReport, Error> {
        let report = self.recovery.run().await?;
        self.proof_state_watcher.start().await?;
        self.mint_quote_watcher.start().await?;
        Ok(report)
    }

    /// Stop the watchers and tear down every mint connection.
    pub async fn shutdown(&self) {
        self.mint_quote_watcher.stop().await;
        self.proof_state_watcher.stop().await;
        self.subscriptions.shutdown().await;
    }

    /// The event bus.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// The storage backend.
    pub fn storage(&self) -> &Arc<dyn WalletStorage> {
        &self.storage
    }

    /// The mint service.
    pub fn mints(&self) -> &Arc<MintService> {
        &self.mints
    }

    /// The counter service.
    pub fn counters(&self) -> &Arc<CounterService> {
        &self.counters
    }

    /// The proof service.
    pub fn proofs(&self) -> &Arc<ProofService> {
        &self.proofs
    }

    /// The wallet cache.
    pub fn wallets(&self) -> &Arc<WalletService> {
        &self.wallets
    }

    /// The send saga runner.
    pub fn sends(&self) -> &Arc<SendSaga> {
        &self.send_saga
    }

    /// The melt saga runner.
    pub fn melts(&self) -> &Arc<MeltSaga> {
        &self.melt_saga
    }

    /// Add a mint by URL.
    pub async fn add_mint(&self, url: &str, trusted: bool) -> Result<MintRecord, Error> {
        self.mints.add_mint(url, trusted).await
    }

    /// Ready balance of one mint.
    pub async fn balance(&self, mint_url: &MintUrl) -> Result<Amount, Error> {
        self.proofs.ready_balance(mint_url).await
    }

    /// Total ready balance across mints.
    pub async fn total_balance(&self) -> Result<Amount, Error> {
        let mut total = Amount::ZERO;
        for mint in self.storage.get_mints().await? {
            total = total
                .checked_add(self.proofs.ready_balance(&mint.mint_url).await?)
                .ok_or(Error::AmountOverflow)?;
        }
        Ok(total)
    }

    /// Request a bolt11 mint quote.
    pub async fn mint_quote(
        &self,
        mint_url: &MintUrl,
        unit: &CurrencyUnit,
        amount: Amount,
    ) -> Result<MintQuote, Error> {
        self.mints.require_trusted(mint_url).await?;
        self.issue.create_quote(mint_url, unit, amount).await
    }

    /// Redeem a paid mint quote by hand (the watcher normally does
    /// this on notification).
    pub async fn redeem_mint_quote(
        &self,
        mint_url: &MintUrl,
        quote_id: &str,
    ) -> Result<Amount, Error> {
        self.issue.redeem(mint_url, quote_id).await
    }

    /// Run a full send: init, prepare, execute. Returns the pending
    /// operation and its outgoing token.
    #[instrument(skip(self), fields(mint_url = %mint_url))]
    pub async fn send(
        &self,
        mint_url: &MintUrl,
        unit: &CurrencyUnit,
        amount: Amount,
        method: SendMethod,
    ) -> Result<(SendOperation, ProofToken), Error> {
        self.mints.require_trusted(mint_url).await?;

        let operation = self
            .send_saga
            .start(mint_url.clone(), unit.clone(), amount, method)
            .await?;
        self.send_saga.prepare(operation.id).await?;
        let operation = self.send_saga.execute(operation.id).await?;

        let SendState::Pending(pending) = &operation.state else {
            return Err(Error::InvalidOperationState(
                "send did not reach pending".to_string(),
            ));
        };
        let token = pending.token.clone();

        Ok((operation, token))
    }

    /// Cancel a send operation.
    pub async fn rollback_send(&self, operation_id: Uuid) -> Result<SendOperation, Error> {
        self.send_saga.rollback(operation_id).await
    }

    /// Request a bolt11 melt quote.
    pub async fn melt_quote(
        &self,
        mint_url: &MintUrl,
        unit: &CurrencyUnit,
        request: String,
    ) -> Result<MeltQuote, Error> {
        self.mints.require_trusted(mint_url).await?;
        self.melt_saga.create_quote(mint_url, unit, request).await
    }

    /// Run a full melt for an existing quote: init, prepare, execute.
    #[instrument(skip(self), fields(mint_url = %mint_url))]
    pub async fn melt(
        &self,
        mint_url: &MintUrl,
        unit: &CurrencyUnit,
        quote_id: &str,
    ) -> Result<MeltOperation, Error> {
        self.mints.require_trusted(mint_url).await?;

        let operation = self
            .melt_saga
            .start(mint_url.clone(), unit.clone(), quote_id)
            .await?;
        self.melt_saga.prepare(operation.id).await?;
        self.melt_saga.execute(operation.id).await
    }

    /// Claim an incoming token: satisfy lock scripts, swap into fresh
    /// deterministic proofs, persist them as ready.
    #[instrument(skip(self, token), fields(mint_url = %token.mint_url))]
    pub async fn receive(&self, token: ProofToken) -> Result<Amount, Error> {
        self.mints.require_trusted(&token.mint_url).await?;

        if token.proofs.is_empty() {
            return Err(Error::ProofValidation("token carries no proofs".to_string()));
        }

        let mint_url = token.mint_url.clone();
        let unit = token.unit.clone();

        let wallet = self.wallets.get_wallet(&mint_url, &unit).await?;
        let incoming = self.proofs.prepare_proofs_for_receiving(token.proofs).await?;

        let incoming_total = Amount::try_sum(incoming.iter().map(|proof| proof.amount))
            .map_err(|_| Error::AmountOverflow)?;

        // The swap burns the incoming keysets' input fee.
        let mut fee_ppk: u64 = 0;
        for proof in &incoming {
            let keyset = wallet
                .keyset(&proof.keyset_id)
                .ok_or(Error::NoActiveKeyset)?;
            fee_ppk += keyset.input_fee_ppk;
        }
        let fee = Amount::from(fee_ppk.div_ceil(1000));
        let receive_amount = incoming_total
            .checked_sub(fee)
            .ok_or(Error::InsufficientBalance)?;

        let mut tx = self.storage.begin_transaction().await?;
        let plan = self
            .proofs
            .create_outputs_and_increment_counters(
                tx.as_mut(),
                &wallet,
                receive_amount,
                Amount::ZERO,
                false,
            )
            .await?;
        tx.commit().await?;
        self.events.emit_all(plan.events).await;

        let blueprint = plan
            .keep
            .ok_or_else(|| Error::ProofValidation("token value is below the fee".to_string()))?;

        let response = self
            .client
            .swap(
                &mint_url,
                cashu::nuts::SwapRequest::new(incoming, blueprint.blinded_messages()),
            )
            .await?;

        let keys = wallet.keys(&blueprint.keyset_id)?;
        let proofs = blueprint.unblind(response.signatures, &keys)?;
        let received = Amount::try_sum(proofs.iter().map(|proof| proof.amount))
            .map_err(|_| Error::AmountOverflow)?;

        let mut records = Vec::with_capacity(proofs.len());
        for proof in &proofs {
            records.push(ProofRecord::new(
                proof.clone(),
                mint_url.clone(),
                ProofState::Ready,
                unit.clone(),
            )?);
        }
        let secrets: Vec<_> = records.iter().map(|record| record.secret().clone()).collect();

        let entry = HistoryEntry::new(
            mint_url.clone(),
            unit.clone(),
            received,
            HistoryKind::Receive,
            None,
        );

        let mut tx = self.storage.begin_transaction().await?;
        tx.save_proofs(records).await?;
        tx.add_history(entry).await?;
        tx.commit().await?;

        self.events
            .emit(WalletEvent::ProofsSaved {
                mint_url: mint_url.clone(),
                secrets,
                unit: unit.clone(),
            })
            .await;
        self.events
            .emit(WalletEvent::ReceiveCreated {
                mint_url,
                amount: received,
            })
            .await;

        Ok(received)
    }

    /// Restore a mint's proofs from seed.
    pub async fn restore(&self, mint_url: &MintUrl) -> Result<Amount, Error> {
        self.mints.require_mint(mint_url).await?;
        self.mints.ensure_fresh(mint_url).await?;
        self.proofs.restore_mint(mint_url).await
    }

    /// Generate a fresh P2PK receive key.
    pub async fn p2pk_receive_key(&self) -> Result<PublicKey, Error> {
        self.proofs.create_p2pk_keypair().await
    }

    /// Audit history, newest first.
    pub async fn history(
        &self,
        mint_url: Option<&MintUrl>,
    ) -> Result<Vec<HistoryEntry>, Error> {
        Ok(self.storage.get_history(mint_url).await?)
    }
}
