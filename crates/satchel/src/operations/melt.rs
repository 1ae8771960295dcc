//! Melt saga (bolt11).
//!
//! `init -> prepared -> executing -> pending -> finalized`, with
//! `failed` as the reclaim terminal. A melt either spends selected
//! proofs directly or, when the selection overshoots the quote total
//! by more than [`SWAP_THRESHOLD_RATIO`], swaps to an exact set first.

use std::sync::Arc;

use cashu::nuts::nut07::State as MintProofState;
use cashu::nuts::{Proofs, PublicKey, SwapRequest};
use cashu::Amount;
use satchel_common::database::WalletStorage;
use satchel_common::history::{HistoryEntry, HistoryKind};
use satchel_common::mint_url::MintUrl;
use satchel_common::operation::{MeltOperation, MeltPrepared, MeltState};
use satchel_common::outputs::OutputBlueprint;
use satchel_common::proof::{ProofRecord, ProofState};
use satchel_common::quotes::{MeltQuote, MeltQuoteState};
use satchel_common::{unix_time, CurrencyUnit, Error};
use tracing::instrument;
use uuid::Uuid;

use crate::events::{EventBus, WalletEvent};
use crate::services::{ProofService, WalletService};
use crate::transport::http::{MeltQuoteResponse, MintClient};

/// Selections exceeding `floor(total * ratio)` swap to an exact set
/// before melting.
pub const SWAP_THRESHOLD_RATIO: f64 = 1.1;

fn swap_threshold(total: Amount) -> u64 {
    (u64::from(total) as f64 * SWAP_THRESHOLD_RATIO).floor() as u64
}

/// Melt operation state machine.
#[derive(Clone)]
pub struct MeltSaga {
    storage: Arc<dyn WalletStorage>,
    events: Arc<EventBus>,
    client: Arc<dyn MintClient>,
    wallets: Arc<WalletService>,
    proofs: Arc<ProofService>,
}

impl std::fmt::Debug for MeltSaga {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeltSaga").finish_non_exhaustive()
    }
}

impl MeltSaga {
    /// Create the saga runner.
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

    async fn load(&self, operation_id: Uuid) -> Result<MeltOperation, Error> {
        self.storage
            .get_melt_operation(operation_id)
            .await?
            .ok_or(Error::UnknownOperation(operation_id))
    }

    async fn persist(&self, operation: &MeltOperation) -> Result<(), Error> {
        let mut tx = self.storage.begin_transaction().await?;
        tx.upsert_melt_operation(operation.clone()).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Request a melt quote from the mint and mirror it locally.
    #[instrument(skip(self, request), fields(mint_url = %mint_url))]
    pub async fn create_quote(
        &self,
        mint_url: &MintUrl,
        unit: &CurrencyUnit,
        request: String,
    ) -> Result<MeltQuote, Error> {
        let response = self
            .client
            .create_melt_quote(mint_url, request.clone(), unit.clone())
            .await?;

        let quote = MeltQuote {
            id: response.quote,
            mint_url: mint_url.clone(),
            unit: unit.clone(),
            amount: response.amount,
            fee_reserve: response.fee_reserve,
            request,
            state: response.state,
            expiry: response.expiry,
            payment_preimage: response.payment_preimage,
            created_at: unix_time(),
        };

        let mut tx = self.storage.begin_transaction().await?;
        tx.add_melt_quote(quote.clone()).await?;
        tx.commit().await?;

        self.events
            .emit(WalletEvent::MeltQuoteCreated {
                quote: quote.clone(),
            })
            .await;

        Ok(quote)
    }

    /// Create a new melt in `init` for an existing quote.
    pub async fn start(
        &self,
        mint_url: MintUrl,
        unit: CurrencyUnit,
        quote_id: &str,
    ) -> Result<MeltOperation, Error> {
        let quote = self
            .storage
            .get_melt_quote(&mint_url, quote_id)
            .await?
            .ok_or_else(|| Error::UnknownQuote(quote_id.to_string()))?;

        let operation = MeltOperation::new(mint_url, unit, quote.id.clone(), quote.amount);
        self.persist(&operation).await?;
        Ok(operation)
    }

    /// Select and reserve inputs, plan outputs, persist `prepared`.
    #[instrument(skip(self))]
    pub async fn prepare(&self, operation_id: Uuid) -> Result<MeltOperation, Error> {
        let mut operation = self.load(operation_id).await?;
        let MeltState::Init { quote_id, .. } = operation.state.clone() else {
            return Err(Error::InvalidOperationState(format!(
                "cannot prepare melt in state `{}`",
                operation.state.name()
            )));
        };

        let quote = self
            .storage
            .get_melt_quote(&operation.mint_url, &quote_id)
            .await?
            .ok_or_else(|| Error::UnknownQuote(quote_id.clone()))?;
        let total = quote.total()?;

        let available = self
            .storage
            .get_available_proofs(&operation.mint_url)
            .await?;
        let wallet = self
            .wallets
            .get_wallet(&operation.mint_url, &operation.unit)
            .await?;

        let selected = wallet.select_proofs(total, &available, false)?;
        let selected_total = Amount::try_sum(selected.iter().map(ProofRecord::amount))
            .map_err(|_| Error::AmountOverflow)?;

        let mut tx = self.storage.begin_transaction().await?;
        let mut pending_events = Vec::new();

        let prepared = if u64::from(selected_total) > swap_threshold(total) {
            // Heavy overshoot: swap down to an exact set first.
            let selected = wallet.select_proofs(total, &available, true)?;
            let swap_fee = wallet.fee_for_proofs(&selected)?;
            let selected_total = Amount::try_sum(selected.iter().map(ProofRecord::amount))
                .map_err(|_| Error::AmountOverflow)?;

            let keep = selected_total
                .checked_sub(total)
                .and_then(|rest| rest.checked_sub(swap_fee))
                .ok_or(Error::InsufficientBalance)?;
            let change_delta = selected_total
                .checked_sub(total)
                .ok_or(Error::InsufficientBalance)?;

            let (change_outputs, blank_events) = self
                .proofs
                .create_blank_outputs(tx.as_mut(), &wallet, change_delta)
                .await?;
            pending_events.extend(blank_events);

            let plan = self
                .proofs
                .create_outputs_and_increment_counters(tx.as_mut(), &wallet, keep, total, false)
                .await?;
            pending_events.extend(plan.events);

            MeltPrepared {
                quote_id: quote.id.clone(),
                amount: quote.amount,
                fee_reserve: quote.fee_reserve,
                swap_fee,
                needs_swap: true,
                input_proof_secrets: selected
                    .iter()
                    .map(|record| record.secret().clone())
                    .collect(),
                change_outputs,
                keep_outputs: plan.keep,
                send_outputs: plan.send,
            }
        } else {
            let change_amount = selected_total
                .checked_sub(quote.amount)
                .ok_or(Error::InsufficientBalance)?;
            let (change_outputs, blank_events) = self
                .proofs
                .create_blank_outputs(tx.as_mut(), &wallet, change_amount)
                .await?;
            pending_events.extend(blank_events);

            MeltPrepared {
                quote_id: quote.id.clone(),
                amount: quote.amount,
                fee_reserve: quote.fee_reserve,
                swap_fee: Amount::ZERO,
                needs_swap: false,
                input_proof_secrets: selected
                    .iter()
                    .map(|record| record.secret().clone())
                    .collect(),
                change_outputs,
                keep_outputs: None,
                send_outputs: None,
            }
        };

        tx.reserve_proofs(
            &operation.mint_url,
            &prepared.input_proof_secrets,
            operation.id,
        )
        .await?;

        let input_secrets = prepared.input_proof_secrets.clone();
        operation.transition(MeltState::Prepared(prepared));
        tx.upsert_melt_operation(operation.clone()).await?;
        tx.commit().await?;

        pending_events.push(WalletEvent::ProofsReserved {
            mint_url: operation.mint_url.clone(),
            secrets: input_secrets,
            operation_id: operation.id,
        });
        self.events.emit_all(pending_events).await;

        Ok(operation)
    }

    /// Run the (optional) pre-melt swap and the melt itself.
    #[instrument(skip(self))]
    pub async fn execute(&self, operation_id: Uuid) -> Result<MeltOperation, Error> {
        let mut operation = self.load(operation_id).await?;
        let MeltState::Prepared(prepared) = operation.state.clone() else {
            return Err(Error::InvalidOperationState(format!(
                "cannot execute melt in state `{}`",
                operation.state.name()
            )));
        };

        operation.transition(MeltState::Executing(prepared.clone()));
        self.persist(&operation).await?;

        let melt_inputs: Proofs = if prepared.needs_swap {
            self.pre_melt_swap(&operation, &prepared).await?
        } else {
            let records = self
                .storage
                .get_proofs_by_secrets(&operation.mint_url, &prepared.input_proof_secrets)
                .await?;

            let mut tx = self.storage.begin_transaction().await?;
            tx.set_proof_state(
                &operation.mint_url,
                &prepared.input_proof_secrets,
                ProofState::Inflight,
            )
            .await?;
            tx.commit().await?;
            self.events
                .emit(WalletEvent::ProofsStateChanged {
                    mint_url: operation.mint_url.clone(),
                    secrets: prepared.input_proof_secrets.clone(),
                    state: ProofState::Inflight,
                })
                .await;

            records.iter().map(|record| record.proof.clone()).collect()
        };

        let response = self
            .client
            .melt(
                &operation.mint_url,
                &prepared.quote_id,
                melt_inputs,
                prepared.change_outputs.blinded_messages(),
            )
            .await?;

        match response.state {
            MeltQuoteState::Paid => self.finalize_paid(operation, prepared, response).await,
            MeltQuoteState::Pending => {
                self.update_quote_state(&operation.mint_url, &prepared.quote_id, &response)
                    .await?;
                operation.transition(MeltState::Pending(prepared));
                self.persist(&operation).await?;
                Ok(operation)
            }
            MeltQuoteState::Unpaid => {
                self.fail_unpaid(operation, prepared, "mint reported the payment unpaid")
                    .await
            }
        }
    }

    /// Settle a PAID melt: mark the melted proofs spent, unblind the
    /// Lightning fee change into the blank outputs, close the
    /// operation.
    async fn finalize_paid(
        &self,
        mut operation: MeltOperation,
        prepared: MeltPrepared,
        response: MeltQuoteResponse,
    ) -> Result<MeltOperation, Error> {
        let wallet = self
            .wallets
            .get_wallet(&operation.mint_url, &operation.unit)
            .await?;

        let melted_secrets = match (&prepared.send_outputs, prepared.needs_swap) {
            (Some(send), true) => send.secrets(),
            _ => prepared.input_proof_secrets.clone(),
        };

        let change_signatures = response.change.clone().unwrap_or_default();
        let change_proofs = if change_signatures.is_empty() {
            Vec::new()
        } else {
            let take = change_signatures.len().min(prepared.change_outputs.len());
            let partial = OutputBlueprint {
                keyset_id: prepared.change_outputs.keyset_id,
                counter_start: prepared.change_outputs.counter_start,
                outputs: prepared.change_outputs.outputs[..take].to_vec(),
            };
            let keys = wallet.keys(&partial.keyset_id)?;
            partial.unblind(
                change_signatures.into_iter().take(take).collect(),
                &keys,
            )?
        };
        let change_amount = Amount::try_sum(change_proofs.iter().map(|proof| proof.amount))
            .map_err(|_| Error::AmountOverflow)?;

        let mut change_records = Vec::with_capacity(change_proofs.len());
        for proof in &change_proofs {
            change_records.push(
                ProofRecord::new(
                    proof.clone(),
                    operation.mint_url.clone(),
                    ProofState::Ready,
                    operation.unit.clone(),
                )?
                .created_by(operation.id),
            );
        }
        let change_secrets: Vec<_> = change_records
            .iter()
            .map(|record| record.secret().clone())
            .collect();

        let melted_total = {
            let records = self
                .storage
                .get_proofs_by_secrets(&operation.mint_url, &melted_secrets)
                .await?;
            Amount::try_sum(records.iter().map(ProofRecord::amount))
                .map_err(|_| Error::AmountOverflow)?
        };
        let fee_paid = melted_total
            .checked_sub(prepared.amount)
            .and_then(|rest| rest.checked_sub(change_amount))
            .unwrap_or(Amount::ZERO);

        let mut quote = self
            .storage
            .get_melt_quote(&operation.mint_url, &prepared.quote_id)
            .await?
            .ok_or_else(|| Error::UnknownQuote(prepared.quote_id.clone()))?;
        quote.state = MeltQuoteState::Paid;
        quote.payment_preimage = response.payment_preimage.clone();

        let entry = HistoryEntry::new(
            operation.mint_url.clone(),
            operation.unit.clone(),
            prepared.amount,
            HistoryKind::Melt {
                quote_id: prepared.quote_id.clone(),
                fee_paid,
                preimage: response.payment_preimage.clone(),
            },
            Some(operation.id),
        );

        let mut tx = self.storage.begin_transaction().await?;
        tx.set_proof_state(&operation.mint_url, &melted_secrets, ProofState::Spent)
            .await?;
        tx.release_proofs(&operation.mint_url, &prepared.input_proof_secrets)
            .await?;
        if !change_records.is_empty() {
            tx.save_proofs(change_records).await?;
        }
        tx.add_melt_quote(quote).await?;
        operation.transition(MeltState::Finalized {
            quote_id: prepared.quote_id.clone(),
            preimage: response.payment_preimage.clone(),
            change_amount,
        });
        tx.upsert_melt_operation(operation.clone()).await?;
        tx.add_history(entry).await?;
        tx.commit().await?;

        self.events
            .emit(WalletEvent::ProofsStateChanged {
                mint_url: operation.mint_url.clone(),
                secrets: melted_secrets,
                state: ProofState::Spent,
            })
            .await;
        if !change_secrets.is_empty() {
            self.events
                .emit(WalletEvent::ProofsSaved {
                    mint_url: operation.mint_url.clone(),
                    secrets: change_secrets,
                    unit: operation.unit.clone(),
                })
                .await;
        }
        self.events
            .emit(WalletEvent::MeltQuotePaid {
                mint_url: operation.mint_url.clone(),
                quote_id: prepared.quote_id.clone(),
                preimage: response.payment_preimage.clone(),
            })
            .await;

        Ok(operation)
    }

    /// Swap the reserved inputs into an exact send set plus keep
    /// change; returns the proofs to melt.
    async fn pre_melt_swap(
        &self,
        operation: &MeltOperation,
        prepared: &MeltPrepared,
    ) -> Result<Proofs, Error> {
        let wallet = self
            .wallets
            .get_wallet(&operation.mint_url, &operation.unit)
            .await?;

        let records = self
            .storage
            .get_proofs_by_secrets(&operation.mint_url, &prepared.input_proof_secrets)
            .await?;
        let inputs: Proofs = records.iter().map(|record| record.proof.clone()).collect();

        let mut tx = self.storage.begin_transaction().await?;
        tx.set_proof_state(
            &operation.mint_url,
            &prepared.input_proof_secrets,
            ProofState::Inflight,
        )
        .await?;
        tx.commit().await?;
        self.events
            .emit(WalletEvent::ProofsStateChanged {
                mint_url: operation.mint_url.clone(),
                secrets: prepared.input_proof_secrets.clone(),
                state: ProofState::Inflight,
            })
            .await;

        let send_blueprint = prepared.send_outputs.as_ref().ok_or_else(|| {
            Error::InvalidOperationState("melt swap without send outputs".to_string())
        })?;

        let mut outputs = prepared
            .keep_outputs
            .as_ref()
            .map(OutputBlueprint::blinded_messages)
            .unwrap_or_default();
        let keep_count = outputs.len();
        outputs.extend(send_blueprint.blinded_messages());

        let response = self
            .client
            .swap(&operation.mint_url, SwapRequest::new(inputs, outputs))
            .await?;

        let mut signatures = response.signatures;
        if signatures.len() < keep_count + send_blueprint.len() {
            return Err(Error::ProofValidation(format!(
                "mint returned {} swap signatures, expected {}",
                signatures.len(),
                keep_count + send_blueprint.len()
            )));
        }
        let send_signatures = signatures.split_off(keep_count);

        let keys = wallet.keys(&send_blueprint.keyset_id)?;
        let keep_proofs = match &prepared.keep_outputs {
            Some(blueprint) => blueprint.unblind(signatures, &keys)?,
            None => Vec::new(),
        };
        let send_proofs = send_blueprint.unblind(send_signatures, &keys)?;

        let mut new_records = Vec::new();
        for proof in &keep_proofs {
            new_records.push(
                ProofRecord::new(
                    proof.clone(),
                    operation.mint_url.clone(),
                    ProofState::Ready,
                    operation.unit.clone(),
                )?
                .created_by(operation.id),
            );
        }
        for proof in &send_proofs {
            new_records.push(
                ProofRecord::new(
                    proof.clone(),
                    operation.mint_url.clone(),
                    ProofState::Inflight,
                    operation.unit.clone(),
                )?
                .created_by(operation.id),
            );
        }
        let saved_secrets: Vec<_> = new_records
            .iter()
            .map(|record| record.secret().clone())
            .collect();

        let mut tx = self.storage.begin_transaction().await?;
        tx.set_proof_state(
            &operation.mint_url,
            &prepared.input_proof_secrets,
            ProofState::Spent,
        )
        .await?;
        tx.save_proofs(new_records).await?;
        tx.commit().await?;

        self.events
            .emit(WalletEvent::ProofsStateChanged {
                mint_url: operation.mint_url.clone(),
                secrets: prepared.input_proof_secrets.clone(),
                state: ProofState::Spent,
            })
            .await;
        self.events
            .emit(WalletEvent::ProofsSaved {
                mint_url: operation.mint_url.clone(),
                secrets: saved_secrets,
                unit: operation.unit.clone(),
            })
            .await;

        Ok(send_proofs)
    }

    /// Unwind an unpaid melt: return our proofs to ready, release the
    /// reservations, close as failed.
    async fn fail_unpaid(
        &self,
        mut operation: MeltOperation,
        prepared: MeltPrepared,
        reason: &str,
    ) -> Result<MeltOperation, Error> {
        let ours = match (&prepared.send_outputs, prepared.needs_swap) {
            (Some(send), true) => send.secrets(),
            _ => prepared.input_proof_secrets.clone(),
        };

        // Only flip proofs that are actually inflight; spent ones are
        // beyond recall.
        let records = self
            .storage
            .get_proofs_by_secrets(&operation.mint_url, &ours)
            .await?;
        let inflight: Vec<_> = records
            .iter()
            .filter(|record| record.state == ProofState::Inflight)
            .map(|record| record.secret().clone())
            .collect();

        let mut tx = self.storage.begin_transaction().await?;
        if !inflight.is_empty() {
            tx.set_proof_state(&operation.mint_url, &inflight, ProofState::Ready)
                .await?;
        }
        tx.release_proofs(&operation.mint_url, &prepared.input_proof_secrets)
            .await?;
        operation.transition(MeltState::Failed {
            reason: reason.to_string(),
        });
        tx.upsert_melt_operation(operation.clone()).await?;
        tx.commit().await?;

        if !inflight.is_empty() {
            self.events
                .emit(WalletEvent::ProofsStateChanged {
                    mint_url: operation.mint_url.clone(),
                    secrets: inflight,
                    state: ProofState::Ready,
                })
                .await;
        }
        self.events
            .emit(WalletEvent::ProofsReleased {
                mint_url: operation.mint_url.clone(),
                secrets: prepared.input_proof_secrets.clone(),
            })
            .await;

        Ok(operation)
    }

    async fn update_quote_state(
        &self,
        mint_url: &MintUrl,
        quote_id: &str,
        response: &MeltQuoteResponse,
    ) -> Result<(), Error> {
        let Some(mut quote) = self.storage.get_melt_quote(mint_url, quote_id).await? else {
            return Ok(());
        };
        quote.state = response.state;
        quote.payment_preimage = response.payment_preimage.clone();

        let mut tx = self.storage.begin_transaction().await?;
        tx.add_melt_quote(quote).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Crash recovery for a melt that died in `executing`, driven by
    /// the quote state at the mint.
    #[instrument(skip(self, operation), fields(operation_id = %operation.id))]
    pub async fn recover_executing(
        &self,
        operation: MeltOperation,
    ) -> Result<MeltOperation, Error> {
        let MeltState::Executing(prepared) = operation.state.clone() else {
            return Err(Error::InvalidOperationState(format!(
                "recover_executing on melt in state `{}`",
                operation.state.name()
            )));
        };
        self.recover_with_quote(operation, prepared).await
    }

    /// Startup check for a `pending` melt.
    #[instrument(skip(self, operation), fields(operation_id = %operation.id))]
    pub async fn recover_pending(&self, operation: MeltOperation) -> Result<MeltOperation, Error> {
        let MeltState::Pending(prepared) = operation.state.clone() else {
            return Err(Error::InvalidOperationState(format!(
                "recover_pending on melt in state `{}`",
                operation.state.name()
            )));
        };
        self.recover_with_quote(operation, prepared).await
    }

    async fn recover_with_quote(
        &self,
        mut operation: MeltOperation,
        prepared: MeltPrepared,
    ) -> Result<MeltOperation, Error> {
        let response = match self
            .client
            .get_melt_quote(&operation.mint_url, &prepared.quote_id)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(
                    operation_id = %operation.id,
                    "mint unreachable during melt recovery: {err}"
                );
                return Ok(operation);
            }
        };

        match response.state {
            MeltQuoteState::Paid => self.finalize_paid(operation, prepared, response).await,
            MeltQuoteState::Pending => {
                self.update_quote_state(&operation.mint_url, &prepared.quote_id, &response)
                    .await?;
                if !matches!(operation.state, MeltState::Pending(_)) {
                    operation.transition(MeltState::Pending(prepared));
                    self.persist(&operation).await?;
                }
                Ok(operation)
            }
            MeltQuoteState::Unpaid => self.recover_unpaid(operation, prepared).await,
        }
    }

    /// The quote never got paid. Decide from the input Y states
    /// whether the pre-melt swap landed, then put every proof we still
    /// control back into circulation.
    async fn recover_unpaid(
        &self,
        operation: MeltOperation,
        prepared: MeltPrepared,
    ) -> Result<MeltOperation, Error> {
        if !prepared.needs_swap {
            // No swap was required; rotate the touched inputs into
            // fresh proofs.
            let records = self
                .storage
                .get_proofs_by_secrets(&operation.mint_url, &prepared.input_proof_secrets)
                .await?;
            let ours: Vec<ProofRecord> = records
                .into_iter()
                .filter(|record| record.state != ProofState::Spent)
                .collect();
            self.proofs
                .reclaim_proofs(&operation.mint_url, &operation.unit, ours)
                .await?;
            return self
                .close_failed(operation, "recovered: melt never got paid")
                .await;
        }

        let records = self
            .storage
            .get_proofs_by_secrets(&operation.mint_url, &prepared.input_proof_secrets)
            .await?;
        let ys: Vec<PublicKey> = records.iter().map(|record| record.y).collect();

        let states = match self.client.check_state(&operation.mint_url, ys).await {
            Ok(states) => states,
            Err(err) => {
                tracing::warn!(
                    operation_id = %operation.id,
                    "mint unreachable during melt recovery: {err}"
                );
                return Ok(operation);
            }
        };
        let swap_landed = states
            .iter()
            .any(|state| state.state == MintProofState::Spent);

        if !swap_landed {
            // Inputs are untouched; flip them back and release.
            return self
                .fail_unpaid(operation, prepared, "recovered: melt never got paid")
                .await;
        }

        let send_secrets = prepared
            .send_outputs
            .as_ref()
            .map(OutputBlueprint::secrets)
            .unwrap_or_default();
        let local_sends = self
            .storage
            .get_proofs_by_secrets(&operation.mint_url, &send_secrets)
            .await?;

        if local_sends.is_empty() {
            // Swap result was never persisted; rematerialize keep and
            // send outputs from the mint.
            let mut blueprints: Vec<&OutputBlueprint> = Vec::new();
            if let Some(keep) = &prepared.keep_outputs {
                blueprints.push(keep);
            }
            if let Some(send) = &prepared.send_outputs {
                blueprints.push(send);
            }
            self.proofs
                .recover_proofs_from_output_data(
                    &operation.mint_url,
                    &operation.unit,
                    &blueprints,
                    Some(operation.id),
                )
                .await?;

            let mut tx = self.storage.begin_transaction().await?;
            tx.set_proof_state(
                &operation.mint_url,
                &prepared.input_proof_secrets,
                ProofState::Spent,
            )
            .await?;
            tx.release_proofs(&operation.mint_url, &prepared.input_proof_secrets)
                .await?;
            tx.commit().await?;
            self.events
                .emit(WalletEvent::ProofsStateChanged {
                    mint_url: operation.mint_url.clone(),
                    secrets: prepared.input_proof_secrets.clone(),
                    state: ProofState::Spent,
                })
                .await;

            return self
                .close_failed(operation, "recovered: swap landed but melt never got paid")
                .await;
        }

        // The swap result is local; make the sends spendable again.
        self.fail_unpaid(operation, prepared, "recovered: melt never got paid")
            .await
    }

    async fn close_failed(
        &self,
        mut operation: MeltOperation,
        reason: &str,
    ) -> Result<MeltOperation, Error> {
        operation.transition(MeltState::Failed {
            reason: reason.to_string(),
        });
        self.persist(&operation).await?;
        Ok(operation)
    }
}
