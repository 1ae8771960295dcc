//! Send saga.
//!
//! `init -> prepared -> executing -> pending -> finalized`, with
//! `rolling_back`/`rolled_back` for cancellation and
//! `recover_executing`/`recover_pending` as the crash entry points.
//! The `default` and `p2pk` methods share the skeleton and differ in
//! how the outgoing outputs are produced.

use std::sync::Arc;

use cashu::nuts::nut07::State as MintProofState;
use cashu::nuts::nut10::Kind;
use cashu::nuts::{Proofs, PublicKey, SwapRequest};
use cashu::Amount;
use satchel_common::database::WalletStorage;
use satchel_common::history::{HistoryEntry, HistoryKind};
use satchel_common::mint_url::MintUrl;
use satchel_common::operation::{
    SendMethod, SendOperation, SendPending, SendPrepared, SendRollback, SendState,
};
use satchel_common::outputs::{OutputBlueprint, PlannedOutput};
use satchel_common::proof::{ProofRecord, ProofState};
use satchel_common::token::ProofToken;
use satchel_common::{CurrencyUnit, Error};
use tracing::instrument;
use uuid::Uuid;

use crate::events::{EventBus, WalletEvent};
use crate::services::{ProofService, WalletService};
use crate::transport::http::MintClient;

/// Send operation state machine.
#[derive(Clone)]
pub struct SendSaga {
    storage: Arc<dyn WalletStorage>,
    events: Arc<EventBus>,
    client: Arc<dyn MintClient>,
    wallets: Arc<WalletService>,
    proofs: Arc<ProofService>,
}

impl std::fmt::Debug for SendSaga {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendSaga").finish_non_exhaustive()
    }
}

impl SendSaga {
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

    async fn load(&self, operation_id: Uuid) -> Result<SendOperation, Error> {
        self.storage
            .get_send_operation(operation_id)
            .await?
            .ok_or(Error::UnknownOperation(operation_id))
    }

    async fn persist(&self, operation: &SendOperation) -> Result<(), Error> {
        let mut tx = self.storage.begin_transaction().await?;
        tx.upsert_send_operation(operation.clone()).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Create a new send in `init`.
    #[instrument(skip(self), fields(mint_url = %mint_url))]
    pub async fn start(
        &self,
        mint_url: MintUrl,
        unit: CurrencyUnit,
        amount: Amount,
        method: SendMethod,
    ) -> Result<SendOperation, Error> {
        if amount == Amount::ZERO {
            return Err(Error::Validation("send amount must be positive".to_string()));
        }

        let operation = SendOperation::new(mint_url, unit, amount, method);
        self.persist(&operation).await?;
        Ok(operation)
    }

    /// Select and reserve inputs, plan outputs, persist `prepared`.
    #[instrument(skip(self))]
    pub async fn prepare(&self, operation_id: Uuid) -> Result<SendOperation, Error> {
        let mut operation = self.load(operation_id).await?;
        let SendState::Init { amount, method } = operation.state.clone() else {
            return Err(Error::InvalidOperationState(format!(
                "cannot prepare send in state `{}`",
                operation.state.name()
            )));
        };

        let available = self
            .storage
            .get_available_proofs(&operation.mint_url)
            .await?;
        let available_total = Amount::try_sum(available.iter().map(ProofRecord::amount))
            .map_err(|_| Error::AmountOverflow)?;
        if available_total < amount {
            return Err(Error::InsufficientBalance);
        }

        let wallet = self
            .wallets
            .get_wallet(&operation.mint_url, &operation.unit)
            .await?;

        let mut tx = self.storage.begin_transaction().await?;
        let mut pending_events = Vec::new();

        let prepared = match method {
            SendMethod::Default => {
                if let Some(selected) = wallet.select_exact(amount, &available) {
                    SendPrepared {
                        amount,
                        method,
                        input_proof_secrets: selected
                            .iter()
                            .map(|record| record.secret().clone())
                            .collect(),
                        needs_swap: false,
                        fee: Amount::ZERO,
                        keep_outputs: None,
                        send_outputs: None,
                    }
                } else {
                    let selected = wallet.select_proofs(amount, &available, true)?;
                    let fee = wallet.fee_for_proofs(&selected)?;
                    let selected_total =
                        Amount::try_sum(selected.iter().map(ProofRecord::amount))
                            .map_err(|_| Error::AmountOverflow)?;
                    let keep = selected_total
                        .checked_sub(amount)
                        .and_then(|rest| rest.checked_sub(fee))
                        .ok_or(Error::InsufficientBalance)?;

                    let plan = self
                        .proofs
                        .create_outputs_and_increment_counters(
                            tx.as_mut(),
                            &wallet,
                            keep,
                            amount,
                            false,
                        )
                        .await?;
                    pending_events.extend(plan.events);

                    SendPrepared {
                        amount,
                        method,
                        input_proof_secrets: selected
                            .iter()
                            .map(|record| record.secret().clone())
                            .collect(),
                        needs_swap: true,
                        fee,
                        keep_outputs: plan.keep,
                        send_outputs: plan.send,
                    }
                }
            }
            SendMethod::P2pk { pubkey } => {
                // Always swap, to re-lock the outputs to the recipient.
                let selected = wallet.select_proofs(amount, &available, true)?;
                let fee = wallet.fee_for_proofs(&selected)?;
                let selected_total = Amount::try_sum(selected.iter().map(ProofRecord::amount))
                    .map_err(|_| Error::AmountOverflow)?;
                let keep = selected_total
                    .checked_sub(amount)
                    .and_then(|rest| rest.checked_sub(fee))
                    .ok_or(Error::InsufficientBalance)?;

                let plan = self
                    .proofs
                    .create_outputs_and_increment_counters(
                        tx.as_mut(),
                        &wallet,
                        keep,
                        Amount::ZERO,
                        false,
                    )
                    .await?;
                pending_events.extend(plan.events);

                let keyset_id = wallet.active_keyset()?.id;
                let send_outputs = p2pk_outputs(amount, keyset_id, &pubkey)?;

                SendPrepared {
                    amount,
                    method,
                    input_proof_secrets: selected
                        .iter()
                        .map(|record| record.secret().clone())
                        .collect(),
                    needs_swap: true,
                    fee,
                    keep_outputs: plan.keep,
                    send_outputs: Some(send_outputs),
                }
            }
        };

        tx.reserve_proofs(
            &operation.mint_url,
            &prepared.input_proof_secrets,
            operation.id,
        )
        .await?;

        let input_secrets = prepared.input_proof_secrets.clone();
        operation.transition(SendState::Prepared(prepared));
        tx.upsert_send_operation(operation.clone()).await?;
        tx.commit().await?;

        pending_events.push(WalletEvent::ProofsReserved {
            mint_url: operation.mint_url.clone(),
            secrets: input_secrets,
            operation_id: operation.id,
        });
        pending_events.push(WalletEvent::SendPrepared {
            operation_id: operation.id,
            mint_url: operation.mint_url.clone(),
            amount,
        });
        self.events.emit_all(pending_events).await;

        Ok(operation)
    }

    /// Run the mint interaction and move to `pending`.
    #[instrument(skip(self))]
    pub async fn execute(&self, operation_id: Uuid) -> Result<SendOperation, Error> {
        let mut operation = self.load(operation_id).await?;
        let SendState::Prepared(prepared) = operation.state.clone() else {
            return Err(Error::InvalidOperationState(format!(
                "cannot execute send in state `{}`",
                operation.state.name()
            )));
        };

        operation.transition(SendState::Executing(prepared.clone()));
        self.persist(&operation).await?;

        if !prepared.needs_swap {
            return self.execute_exact(operation, prepared).await;
        }
        self.execute_swap(operation, prepared).await
    }

    /// Exact match: the reserved inputs are the outgoing token.
    async fn execute_exact(
        &self,
        mut operation: SendOperation,
        prepared: SendPrepared,
    ) -> Result<SendOperation, Error> {
        let records = self
            .storage
            .get_proofs_by_secrets(&operation.mint_url, &prepared.input_proof_secrets)
            .await?;

        let token = ProofToken::new(
            operation.mint_url.clone(),
            operation.unit.clone(),
            None,
            records.iter().map(|record| record.proof.clone()).collect(),
        );

        let mut tx = self.storage.begin_transaction().await?;
        tx.set_proof_state(
            &operation.mint_url,
            &prepared.input_proof_secrets,
            ProofState::Inflight,
        )
        .await?;
        operation.transition(SendState::Pending(SendPending {
            prepared: prepared.clone(),
            token: token.clone(),
        }));
        tx.upsert_send_operation(operation.clone()).await?;
        tx.commit().await?;

        self.events
            .emit(WalletEvent::ProofsStateChanged {
                mint_url: operation.mint_url.clone(),
                secrets: prepared.input_proof_secrets.clone(),
                state: ProofState::Inflight,
            })
            .await;
        self.events
            .emit(WalletEvent::SendPending {
                operation_id: operation.id,
                mint_url: operation.mint_url.clone(),
                token,
            })
            .await;

        Ok(operation)
    }

    /// Swap the reserved inputs into fresh keep and send proofs.
    async fn execute_swap(
        &self,
        mut operation: SendOperation,
        prepared: SendPrepared,
    ) -> Result<SendOperation, Error> {
        let wallet = self
            .wallets
            .get_wallet(&operation.mint_url, &operation.unit)
            .await?;

        let records = self
            .storage
            .get_proofs_by_secrets(&operation.mint_url, &prepared.input_proof_secrets)
            .await?;
        let inputs: Proofs = records.iter().map(|record| record.proof.clone()).collect();

        let keep_blueprint = prepared.keep_outputs.clone();
        let send_blueprint = prepared.send_outputs.clone().ok_or_else(|| {
            Error::InvalidOperationState("swap send without send outputs".to_string())
        })?;

        let mut outputs = keep_blueprint
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
        let keep_proofs = match &keep_blueprint {
            Some(blueprint) => blueprint.unblind(signatures, &keys)?,
            None => Vec::new(),
        };
        let send_proofs = send_blueprint.unblind(send_signatures, &keys)?;

        let token = ProofToken::new(
            operation.mint_url.clone(),
            operation.unit.clone(),
            None,
            send_proofs.clone(),
        );

        let mut keep_records = Vec::with_capacity(keep_proofs.len());
        for proof in &keep_proofs {
            keep_records.push(
                ProofRecord::new(
                    proof.clone(),
                    operation.mint_url.clone(),
                    ProofState::Ready,
                    operation.unit.clone(),
                )?
                .created_by(operation.id),
            );
        }
        let mut send_records = Vec::with_capacity(send_proofs.len());
        for proof in &send_proofs {
            send_records.push(
                ProofRecord::new(
                    proof.clone(),
                    operation.mint_url.clone(),
                    ProofState::Inflight,
                    operation.unit.clone(),
                )?
                .created_by(operation.id),
            );
        }

        let keep_secrets: Vec<_> = keep_records.iter().map(|r| r.secret().clone()).collect();
        let send_secrets: Vec<_> = send_records.iter().map(|r| r.secret().clone()).collect();

        let mut tx = self.storage.begin_transaction().await?;
        tx.save_proofs(keep_records).await?;
        tx.save_proofs(send_records).await?;
        tx.set_proof_state(
            &operation.mint_url,
            &prepared.input_proof_secrets,
            ProofState::Spent,
        )
        .await?;
        operation.transition(SendState::Pending(SendPending {
            prepared: prepared.clone(),
            token: token.clone(),
        }));
        tx.upsert_send_operation(operation.clone()).await?;
        tx.commit().await?;

        let mut saved_secrets = keep_secrets;
        saved_secrets.extend(send_secrets.iter().cloned());
        self.events
            .emit(WalletEvent::ProofsSaved {
                mint_url: operation.mint_url.clone(),
                secrets: saved_secrets,
                unit: operation.unit.clone(),
            })
            .await;
        self.events
            .emit(WalletEvent::ProofsStateChanged {
                mint_url: operation.mint_url.clone(),
                secrets: prepared.input_proof_secrets.clone(),
                state: ProofState::Spent,
            })
            .await;
        self.events
            .emit(WalletEvent::ProofsStateChanged {
                mint_url: operation.mint_url.clone(),
                secrets: send_secrets,
                state: ProofState::Inflight,
            })
            .await;
        self.events
            .emit(WalletEvent::SendPending {
                operation_id: operation.id,
                mint_url: operation.mint_url.clone(),
                token,
            })
            .await;

        Ok(operation)
    }

    /// All send proofs confirmed spent: release reservations and close
    /// the operation.
    #[instrument(skip(self))]
    pub async fn finalize(&self, operation_id: Uuid) -> Result<SendOperation, Error> {
        let mut operation = self.load(operation_id).await?;
        let SendState::Pending(pending) = operation.state.clone() else {
            return Err(Error::InvalidOperationState(format!(
                "cannot finalize send in state `{}`",
                operation.state.name()
            )));
        };

        let mut release = pending.prepared.input_proof_secrets.clone();
        release.extend(pending.token.proofs.iter().map(|p| p.secret.clone()));
        if let Some(keep) = &pending.prepared.keep_outputs {
            release.extend(keep.secrets());
        }

        let amount = pending.token.total_amount()?;
        let entry = HistoryEntry::new(
            operation.mint_url.clone(),
            operation.unit.clone(),
            amount,
            HistoryKind::Send {
                fee: pending.prepared.fee,
            },
            Some(operation.id),
        );

        let mut tx = self.storage.begin_transaction().await?;
        tx.release_proofs(&operation.mint_url, &release).await?;
        operation.transition(SendState::Finalized(pending));
        tx.upsert_send_operation(operation.clone()).await?;
        tx.add_history(entry).await?;
        tx.commit().await?;

        self.events
            .emit(WalletEvent::ProofsReleased {
                mint_url: operation.mint_url.clone(),
                secrets: release,
            })
            .await;
        self.events
            .emit(WalletEvent::SendFinalized {
                operation_id: operation.id,
                mint_url: operation.mint_url.clone(),
            })
            .await;

        Ok(operation)
    }

    /// Cancel a prepared or pending send.
    #[instrument(skip(self))]
    pub async fn rollback(&self, operation_id: Uuid) -> Result<SendOperation, Error> {
        let operation = self.load(operation_id).await?;

        match operation.state.clone() {
            SendState::Prepared(prepared) => {
                self.rollback_released(operation, prepared.input_proof_secrets, None)
                    .await
            }
            SendState::Pending(pending) => match pending.prepared.method {
                SendMethod::Default => self.rollback_pending_default(operation, pending).await,
                SendMethod::P2pk { .. } => {
                    tracing::warn!(
                        operation_id = %operation.id,
                        "rolling back a p2pk send; the locked token cannot be reclaimed"
                    );
                    self.rollback_released(
                        operation,
                        pending.prepared.input_proof_secrets.clone(),
                        None,
                    )
                    .await
                }
            },
            other => Err(Error::InvalidOperationState(format!(
                "cannot roll back send in state `{}`",
                other.name()
            ))),
        }
    }

    /// Release reservations and close the operation as rolled back.
    async fn rollback_released(
        &self,
        mut operation: SendOperation,
        secrets: Vec<cashu::secret::Secret>,
        reason: Option<String>,
    ) -> Result<SendOperation, Error> {
        let mut tx = self.storage.begin_transaction().await?;
        tx.release_proofs(&operation.mint_url, &secrets).await?;
        operation.transition(SendState::RolledBack { reason });
        tx.upsert_send_operation(operation.clone()).await?;
        tx.commit().await?;

        self.events
            .emit(WalletEvent::ProofsReleased {
                mint_url: operation.mint_url.clone(),
                secrets,
            })
            .await;
        self.events
            .emit(WalletEvent::SendRolledBack {
                operation_id: operation.id,
                mint_url: operation.mint_url.clone(),
            })
            .await;

        Ok(operation)
    }

    /// Reclaim an outstanding default token by swapping its inflight
    /// proofs back into keep proofs.
    async fn rollback_pending_default(
        &self,
        mut operation: SendOperation,
        pending: SendPending,
    ) -> Result<SendOperation, Error> {
        operation.transition(SendState::RollingBack(SendRollback {
            prepared: pending.prepared.clone(),
            token: Some(pending.token.clone()),
        }));
        self.persist(&operation).await?;

        let send_secrets: Vec<_> = pending
            .token
            .proofs
            .iter()
            .map(|proof| proof.secret.clone())
            .collect();
        let records = self
            .storage
            .get_proofs_by_secrets(&operation.mint_url, &send_secrets)
            .await?;
        let inflight: Vec<ProofRecord> = records
            .into_iter()
            .filter(|record| record.state == ProofState::Inflight)
            .collect();

        self.proofs
            .reclaim_proofs(&operation.mint_url, &operation.unit, inflight)
            .await?;

        self.rollback_released(operation, pending.prepared.input_proof_secrets, None)
            .await
    }

    /// Crash recovery for an operation that died in `executing`.
    #[instrument(skip(self, operation), fields(operation_id = %operation.id))]
    pub async fn recover_executing(
        &self,
        operation: SendOperation,
    ) -> Result<SendOperation, Error> {
        let SendState::Executing(prepared) = operation.state.clone() else {
            return Err(Error::InvalidOperationState(format!(
                "recover_executing on send in state `{}`",
                operation.state.name()
            )));
        };

        // Exact-match sends never talked to the mint from `executing`.
        if !prepared.needs_swap {
            return self
                .rollback_released(operation, prepared.input_proof_secrets, None)
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
                    "mint unreachable during send recovery, leaving executing: {err}"
                );
                return Ok(operation);
            }
        };

        let any_spent = states
            .iter()
            .any(|state| state.state == MintProofState::Spent);

        if !any_spent {
            // The swap never landed; the inputs are still ours.
            return self
                .rollback_released(operation, prepared.input_proof_secrets, None)
                .await;
        }

        // The swap succeeded but its result was never persisted.
        // Rematerialize the outputs from the mint; for p2pk the send
        // outputs belong to the recipient's key and stay out.
        let mut blueprints: Vec<&OutputBlueprint> = Vec::new();
        if let Some(keep) = &prepared.keep_outputs {
            blueprints.push(keep);
        }
        if matches!(prepared.method, SendMethod::Default) {
            if let Some(send) = &prepared.send_outputs {
                blueprints.push(send);
            }
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

        self.rollback_released(
            operation,
            Vec::new(),
            Some("recovered: swap succeeded but token never returned".to_string()),
        )
        .await
    }

    /// Startup check for a `pending` send: finalize when every send
    /// secret is spent at the mint, otherwise leave it pending.
    #[instrument(skip(self, operation), fields(operation_id = %operation.id))]
    pub async fn recover_pending(&self, operation: SendOperation) -> Result<SendOperation, Error> {
        let SendState::Pending(pending) = operation.state.clone() else {
            return Err(Error::InvalidOperationState(format!(
                "recover_pending on send in state `{}`",
                operation.state.name()
            )));
        };

        let ys = pending
            .token
            .proofs
            .iter()
            .map(cashu::nuts::Proof::y)
            .collect::<Result<Vec<_>, _>>()?;

        let states = match self.client.check_state(&operation.mint_url, ys).await {
            Ok(states) => states,
            Err(err) => {
                tracing::warn!(
                    operation_id = %operation.id,
                    "mint unreachable while settling pending send: {err}"
                );
                return Ok(operation);
            }
        };

        let all_spent = !states.is_empty()
            && states
                .iter()
                .all(|state| state.state == MintProofState::Spent);

        if !all_spent {
            return Ok(operation);
        }

        let send_secrets: Vec<_> = pending
            .token
            .proofs
            .iter()
            .map(|proof| proof.secret.clone())
            .collect();

        let known = self
            .storage
            .get_proofs_by_secrets(&operation.mint_url, &send_secrets)
            .await?;
        let not_yet_spent: Vec<_> = known
            .iter()
            .filter(|record| record.state != ProofState::Spent)
            .map(|record| record.secret().clone())
            .collect();

        if !not_yet_spent.is_empty() {
            let mut tx = self.storage.begin_transaction().await?;
            tx.set_proof_state(&operation.mint_url, &not_yet_spent, ProofState::Spent)
                .await?;
            tx.commit().await?;
            self.events
                .emit(WalletEvent::ProofsStateChanged {
                    mint_url: operation.mint_url.clone(),
                    secrets: not_yet_spent,
                    state: ProofState::Spent,
                })
                .await;
        }

        self.finalize(operation.id).await
    }
}

/// Build P2PK-locked outputs for `amount`: structured NUT-10 secrets
/// with fresh blinding factors. Not derivable from seed, which is why
/// the blueprint is persisted before execution.
fn p2pk_outputs(
    amount: Amount,
    keyset_id: cashu::nuts::Id,
    pubkey: &PublicKey,
) -> Result<OutputBlueprint, Error> {
    let mut outputs = Vec::new();

    for (index, part) in amount.split().into_iter().enumerate() {
        let nut10_secret = cashu::nuts::nut10::Secret::new(
            Kind::P2PK,
            pubkey.to_hex(),
            None::<Vec<Vec<String>>>,
        );
        let secret = cashu::secret::Secret::new(serde_json::to_string(&nut10_secret)?);
        let (blinded, r) = cashu::dhke::blind_message(&secret.to_bytes(), None)?;

        outputs.push(PlannedOutput {
            amount: part,
            counter: index as u32,
            secret,
            r,
            blinded: cashu::nuts::BlindedMessage::new(part, keyset_id, blinded),
        });
    }

    Ok(OutputBlueprint {
        keyset_id,
        counter_start: 0,
        outputs,
    })
}
