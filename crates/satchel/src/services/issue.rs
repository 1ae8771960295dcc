//! Mint (issue) flow: bolt11 mint quotes and their redemption.

use std::sync::Arc;

use cashu::Amount;
use satchel_common::database::WalletStorage;
use satchel_common::history::{HistoryEntry, HistoryKind};
use satchel_common::mint_url::MintUrl;
use satchel_common::proof::{ProofRecord, ProofState};
use satchel_common::quotes::{MintQuote, MintQuoteState};
use satchel_common::{unix_time, CurrencyUnit, Error};
use tracing::instrument;

use super::proofs::ProofService;
use super::wallets::WalletService;
use crate::events::{EventBus, WalletEvent};
use crate::transport::http::MintClient;

/// Issues ecash against paid bolt11 invoices.
#[derive(Clone)]
pub struct IssueService {
    storage: Arc<dyn WalletStorage>,
    events: Arc<EventBus>,
    client: Arc<dyn MintClient>,
    wallets: Arc<WalletService>,
    proofs: Arc<ProofService>,
}

impl std::fmt::Debug for IssueService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssueService").finish_non_exhaustive()
    }
}

impl IssueService {
    /// Create the service.
    pub fn new(
        storage: Arc<dyn WalletStorage>,
        events: Arc<EventBus>,
        client: Arc<dyn MintClient>,
        wallets: Arc<WalletService>,
        proofs: Arc<ProofService>,
    ) -> Self {
        Self {
            storage,
            events,
            client,
            wallets,
            proofs,
        }
    }

    /// Request a bolt11 mint quote and mirror it locally.
    #[instrument(skip(self), fields(mint_url = %mint_url))]
    pub async fn create_quote(
        &self,
        mint_url: &MintUrl,
        unit: &CurrencyUnit,
        amount: Amount,
    ) -> Result<MintQuote, Error> {
        if amount == Amount::ZERO {
            return Err(Error::Validation("mint amount must be positive".to_string()));
        }

        let response = self
            .client
            .create_mint_quote(mint_url, amount, unit.clone())
            .await?;

        let mut quote = MintQuote::new(
            response.quote,
            mint_url.clone(),
            amount,
            unit.clone(),
            response.request,
            response.expiry,
        );
        quote.state = response.state;

        let mut tx = self.storage.begin_transaction().await?;
        tx.add_mint_quote(quote.clone()).await?;
        tx.commit().await?;

        self.events
            .emit(WalletEvent::MintQuoteCreated {
                quote: quote.clone(),
            })
            .await;

        Ok(quote)
    }

    /// Mirror a state observed at the mint.
    pub async fn update_quote_state(
        &self,
        mint_url: &MintUrl,
        quote_id: &str,
        state: MintQuoteState,
    ) -> Result<(), Error> {
        let Some(mut quote) = self.storage.get_mint_quote(mint_url, quote_id).await? else {
            return Ok(());
        };
        if quote.state == state {
            return Ok(());
        }
        quote.state = state;

        let mut tx = self.storage.begin_transaction().await?;
        tx.add_mint_quote(quote).await?;
        tx.commit().await?;

        self.events
            .emit(WalletEvent::MintQuoteStateChanged {
                mint_url: mint_url.clone(),
                quote_id: quote_id.to_string(),
                state,
            })
            .await;

        Ok(())
    }

    /// Redeem a PAID quote: derive deterministic outputs, have the
    /// mint sign them, persist the proofs as ready.
    #[instrument(skip(self), fields(mint_url = %mint_url))]
    pub async fn redeem(&self, mint_url: &MintUrl, quote_id: &str) -> Result<Amount, Error> {
        let quote = self
            .storage
            .get_mint_quote(mint_url, quote_id)
            .await?
            .ok_or_else(|| Error::UnknownQuote(quote_id.to_string()))?;

        if quote.state == MintQuoteState::Issued {
            return Ok(Amount::ZERO);
        }
        if quote.is_expired(unix_time()) {
            return Err(Error::QuoteExpired);
        }

        let wallet = self.wallets.get_wallet(mint_url, &quote.unit).await?;

        let mut tx = self.storage.begin_transaction().await?;
        let plan = self
            .proofs
            .create_outputs_and_increment_counters(
                tx.as_mut(),
                &wallet,
                quote.amount,
                Amount::ZERO,
                false,
            )
            .await?;
        tx.commit().await?;
        self.events.emit_all(plan.events).await;

        let blueprint = plan
            .keep
            .ok_or_else(|| Error::Custom("mint quote produced no outputs".to_string()))?;

        let signatures = self
            .client
            .mint(mint_url, quote_id, blueprint.blinded_messages())
            .await?;

        let keys = wallet.keys(&blueprint.keyset_id)?;
        let proofs = blueprint.unblind(signatures, &keys)?;
        let minted = Amount::try_sum(proofs.iter().map(|proof| proof.amount))
            .map_err(|_| Error::AmountOverflow)?;

        let mut records = Vec::with_capacity(proofs.len());
        for proof in &proofs {
            records.push(ProofRecord::new(
                proof.clone(),
                mint_url.clone(),
                ProofState::Ready,
                quote.unit.clone(),
            )?);
        }
        let secrets: Vec<_> = records.iter().map(|record| record.secret().clone()).collect();

        let mut issued = quote.clone();
        issued.state = MintQuoteState::Issued;

        let entry = HistoryEntry::new(
            mint_url.clone(),
            quote.unit.clone(),
            minted,
            HistoryKind::Mint {
                quote_id: quote_id.to_string(),
            },
            None,
        );

        let mut tx = self.storage.begin_transaction().await?;
        tx.save_proofs(records).await?;
        tx.add_mint_quote(issued.clone()).await?;
        tx.add_history(entry).await?;
        tx.commit().await?;

        self.events
            .emit(WalletEvent::ProofsSaved {
                mint_url: mint_url.clone(),
                secrets,
                unit: quote.unit.clone(),
            })
            .await;
        self.events
            .emit(WalletEvent::MintQuoteStateChanged {
                mint_url: mint_url.clone(),
                quote_id: quote_id.to_string(),
                state: MintQuoteState::Issued,
            })
            .await;
        self.events
            .emit(WalletEvent::MintQuoteRedeemed {
                quote: issued,
                amount: minted,
            })
            .await;

        Ok(minted)
    }
}
