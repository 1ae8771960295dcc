//! Proof ledger service: deterministic outputs, selection, receive
//! preparation, inflight reconciliation and restore.

use std::collections::HashMap;
use std::sync::Arc;

use cashu::nuts::nut07::State as MintProofState;
use cashu::nuts::nut10::spending_conditions::SpendingConditions;
use cashu::nuts::{Id, Proof, Proofs, PublicKey, SecretKey};
use cashu::Amount;
use satchel_common::database::{StorageTransaction, WalletStorage};
use satchel_common::mint_url::MintUrl;
use satchel_common::outputs::{derive_outputs, OutputBlueprint, PlannedOutput};
use satchel_common::proof::{ProofRecord, ProofState};
use satchel_common::{CurrencyUnit, Error};
use tracing::instrument;
use uuid::Uuid;

use super::counters::CounterService;
use super::wallets::WalletService;
use crate::events::{EventBus, WalletEvent};
use crate::transport::http::MintClient;
use crate::wallet::Wallet;
use crate::SeedProvider;

/// Restore walks each keyset in batches of this many indices.
const RESTORE_BATCH_SIZE: u32 = 100;
/// Restore stops after this many consecutive empty batches.
const RESTORE_EMPTY_BATCHES: u32 = 3;

/// Deterministic outputs planned for an operation, with the events to
/// emit once the surrounding transaction committed.
#[derive(Debug)]
pub struct OutputPlan {
    /// Outputs for the amount the wallet keeps
    pub keep: Option<OutputBlueprint>,
    /// Outputs for the amount being sent
    pub send: Option<OutputBlueprint>,
    /// Send amount, inflated when fees were included
    pub send_total: Amount,
    /// Keep amount, reduced by the inflation delta
    pub keep_total: Amount,
    /// Events the caller emits after commit
    pub events: Vec<WalletEvent>,
}

/// Proof ledger accessor.
#[derive(Clone)]
pub struct ProofService {
    storage: Arc<dyn WalletStorage>,
    events: Arc<EventBus>,
    client: Arc<dyn MintClient>,
    counters: Arc<CounterService>,
    wallets: Arc<WalletService>,
    seed: SeedProvider,
}

impl std::fmt::Debug for ProofService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProofService").finish_non_exhaustive()
    }
}

impl ProofService {
    /// Create the service.
    pub fn new(
        storage: Arc<dyn WalletStorage>,
        events: Arc<EventBus>,
        client: Arc<dyn MintClient>,
        counters: Arc<CounterService>,
        wallets: Arc<WalletService>,
        seed: SeedProvider,
    ) -> Self {
        Self {
            storage,
            events,
            client,
            counters,
            wallets,
            seed,
        }
    }

    /// Sum of ready proofs of a mint.
    pub async fn ready_balance(&self, mint_url: &MintUrl) -> Result<Amount, Error> {
        let proofs = self.storage.get_ready_proofs(mint_url).await?;
        Amount::try_sum(proofs.iter().map(ProofRecord::amount)).map_err(|_| Error::AmountOverflow)
    }

    /// Derive deterministic outputs for a keep and a send amount and
    /// advance the keyset counter by their combined length, atomically
    /// with the caller's transaction.
    ///
    /// With `include_fees` the send amount is inflated until it also
    /// covers the receiver's input fee for the resulting output count;
    /// the delta comes out of the keep amount.
    #[instrument(skip(self, tx, wallet), fields(mint_url = %wallet.mint_url()))]
    pub async fn create_outputs_and_increment_counters(
        &self,
        tx: &mut dyn StorageTransaction,
        wallet: &Wallet,
        keep: Amount,
        send: Amount,
        include_fees: bool,
    ) -> Result<OutputPlan, Error> {
        let keyset = wallet.active_keyset()?.clone();
        let seed = (self.seed)()?;

        let mut keep_total = keep;
        let mut send_total = send;

        if include_fees && send > Amount::ZERO {
            // Iterate until the fee for the send outputs stabilizes.
            loop {
                let output_count = send_total.split().len();
                let receive_fee = keyset.fee_for_inputs(output_count);
                let candidate = send
                    .checked_add(receive_fee)
                    .ok_or(Error::AmountOverflow)?;
                if candidate == send_total {
                    break;
                }
                send_total = candidate;
            }

            let delta = send_total
                .checked_sub(send)
                .ok_or(Error::AmountOverflow)?;
            keep_total = keep_total
                .checked_sub(delta)
                .ok_or(Error::InsufficientBalance)?;
        }

        let keep_amounts = keep_total.split();
        let send_amounts = send_total.split();
        let total_count = (keep_amounts.len() + send_amounts.len()) as u32;

        let (range, counter_event) = self
            .counters
            .increment_in_tx(tx, wallet.mint_url(), &keyset.id, total_count)
            .await?;

        let keep_blueprint = (!keep_amounts.is_empty())
            .then(|| derive_outputs(&seed, keyset.id, range.start, &keep_amounts))
            .transpose()?;
        let send_blueprint = (!send_amounts.is_empty())
            .then(|| {
                derive_outputs(
                    &seed,
                    keyset.id,
                    range.start + keep_amounts.len() as u32,
                    &send_amounts,
                )
            })
            .transpose()?;

        Ok(OutputPlan {
            keep: keep_blueprint,
            send: send_blueprint,
            send_total,
            keep_total,
            events: vec![counter_event],
        })
    }

    /// Derive blank zero-valued outputs for melt change and advance the
    /// counter accordingly.
    ///
    /// `max(ceil(log2(amount)), 1)` outputs for a positive amount,
    /// none for zero.
    pub async fn create_blank_outputs(
        &self,
        tx: &mut dyn StorageTransaction,
        wallet: &Wallet,
        amount: Amount,
    ) -> Result<(OutputBlueprint, Vec<WalletEvent>), Error> {
        let keyset = wallet.active_keyset()?;

        if amount == Amount::ZERO {
            let current = tx
                .get_counter(wallet.mint_url(), &keyset.id)
                .await?
                .unwrap_or(0);
            return Ok((OutputBlueprint::empty(keyset.id, current), Vec::new()));
        }

        let count = ((u64::from(amount) as f64).log2().ceil() as u64).max(1) as usize;
        let seed = (self.seed)()?;

        let (range, counter_event) = self
            .counters
            .increment_in_tx(tx, wallet.mint_url(), &keyset.id, count as u32)
            .await?;

        let blueprint = derive_outputs(
            &seed,
            keyset.id,
            range.start,
            &vec![Amount::ZERO; count],
        )?;

        Ok((blueprint, vec![counter_event]))
    }

    /// Select ready proofs covering `amount` with the wallet's
    /// denomination selector. Reservations are not considered here;
    /// callers that need unreserved proofs select from
    /// `get_available_proofs`.
    pub async fn select_proofs_to_send(
        &self,
        mint_url: &MintUrl,
        unit: &CurrencyUnit,
        amount: Amount,
        include_fees: bool,
    ) -> Result<Vec<ProofRecord>, Error> {
        let wallet = self.wallets.get_wallet(mint_url, unit).await?;
        let pool = self.storage.get_ready_proofs(mint_url).await?;
        wallet.select_proofs(amount, &pool, include_fees)
    }

    /// Scan incoming proofs and satisfy their lock scripts.
    ///
    /// Plain proofs pass through. P2PK-locked proofs are signed with
    /// the matching keyring key. Any unsupported lock script or a
    /// multisig lock fails the whole receive.
    pub async fn prepare_proofs_for_receiving(&self, proofs: Proofs) -> Result<Proofs, Error> {
        let mut prepared = Vec::with_capacity(proofs.len());

        for mut proof in proofs {
            let is_structured = serde_json::from_str::<serde_json::Value>(&proof.secret.to_string())
                .map(|value| value.is_array())
                .unwrap_or(false);

            if !is_structured {
                prepared.push(proof);
                continue;
            }

            let conditions = SpendingConditions::try_from(&proof.secret).map_err(|_| {
                Error::ProofValidation("unsupported lock script in incoming proof".to_string())
            })?;

            match conditions {
                SpendingConditions::P2PKConditions { data, conditions } => {
                    let extra_pubkeys = conditions
                        .and_then(|c| c.pubkeys)
                        .map(|pubkeys| !pubkeys.is_empty())
                        .unwrap_or(false);
                    if extra_pubkeys {
                        return Err(Error::ProofValidation(
                            "multisig locks are not supported".to_string(),
                        ));
                    }

                    let secret_key = self
                        .storage
                        .get_keypair(&data)
                        .await?
                        .ok_or_else(|| {
                            Error::ProofValidation(format!(
                                "no keypair for p2pk lock to {data}"
                            ))
                        })?;
                    proof.sign_p2pk(secret_key)?;
                }
                _ => {
                    return Err(Error::ProofValidation(
                        "unsupported lock script in incoming proof".to_string(),
                    ));
                }
            }

            prepared.push(proof);
        }

        Ok(prepared)
    }

    /// Ask each mint about its inflight proofs and settle the ones the
    /// mint reports spent. Mint-side failures are logged and do not
    /// propagate.
    #[instrument(skip(self))]
    pub async fn check_inflight_proofs(&self) -> Result<(), Error> {
        let inflight = self.storage.get_inflight_proofs().await?;

        let mut by_mint: HashMap<MintUrl, Vec<ProofRecord>> = HashMap::new();
        for record in inflight {
            by_mint.entry(record.mint_url.clone()).or_default().push(record);
        }

        for (mint_url, records) in by_mint {
            let ys: Vec<PublicKey> = records.iter().map(|record| record.y).collect();

            let states = match self.client.check_state(&mint_url, ys.clone()).await {
                Ok(states) => states,
                Err(err) => {
                    tracing::warn!(%mint_url, "inflight check failed: {err}");
                    continue;
                }
            };

            if states.len() != records.len() {
                tracing::warn!(
                    %mint_url,
                    expected = records.len(),
                    got = states.len(),
                    "malformed checkstate response, skipping mint"
                );
                continue;
            }

            let spent: Vec<_> = records
                .iter()
                .zip(states)
                .filter(|(_, state)| state.state == MintProofState::Spent)
                .map(|(record, _)| record.secret().clone())
                .collect();

            if spent.is_empty() {
                continue;
            }

            let mut tx = self.storage.begin_transaction().await?;
            tx.set_proof_state(&mint_url, &spent, ProofState::Spent)
                .await?;
            tx.commit().await?;

            self.events
                .emit(WalletEvent::ProofsStateChanged {
                    mint_url: mint_url.clone(),
                    secrets: spent,
                    state: ProofState::Spent,
                })
                .await;
        }

        Ok(())
    }

    /// Rematerialize proofs from persisted output blueprints via the
    /// mint's restore endpoint, saving only the ones the mint still
    /// reports unspent.
    #[instrument(skip(self, blueprints), fields(mint_url = %mint_url))]
    pub async fn recover_proofs_from_output_data(
        &self,
        mint_url: &MintUrl,
        unit: &CurrencyUnit,
        blueprints: &[&OutputBlueprint],
        created_by: Option<Uuid>,
    ) -> Result<Proofs, Error> {
        let planned: Vec<&PlannedOutput> = blueprints
            .iter()
            .flat_map(|blueprint| blueprint.outputs.iter())
            .collect();
        if planned.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .restore(
                mint_url,
                planned.iter().map(|output| output.blinded.clone()).collect(),
            )
            .await?;

        let wallet = self.wallets.get_wallet(mint_url, unit).await?;
        let proofs = self.unblind_restored(&wallet, &planned, response)?;
        if proofs.is_empty() {
            return Ok(Vec::new());
        }

        let unspent = self.filter_unspent(mint_url, proofs).await?;
        self.save_recovered(mint_url, unit, unspent, created_by).await
    }

    /// Match a restore response against planned outputs and unblind the
    /// returned signatures, grouped by keyset.
    fn unblind_restored(
        &self,
        wallet: &Wallet,
        planned: &[&PlannedOutput],
        response: cashu::nuts::RestoreResponse,
    ) -> Result<Proofs, Error> {
        let mut by_keyset: HashMap<Id, Vec<(&PlannedOutput, cashu::nuts::BlindSignature)>> =
            HashMap::new();

        for (returned, signature) in response.outputs.iter().zip(response.signatures) {
            let Some(output) = planned
                .iter()
                .find(|output| output.blinded.blinded_secret == returned.blinded_secret)
            else {
                tracing::warn!("mint returned a signature for an unknown blinded message");
                continue;
            };
            by_keyset
                .entry(output.blinded.keyset_id)
                .or_default()
                .push((output, signature));
        }

        let mut proofs = Vec::new();
        for (keyset_id, matched) in by_keyset {
            let keys = wallet.keys(&keyset_id)?;
            let signatures: Vec<_> = matched.iter().map(|(_, sig)| sig.clone()).collect();
            let rs: Vec<SecretKey> = matched.iter().map(|(output, _)| output.r.clone()).collect();
            let secrets = matched
                .iter()
                .map(|(output, _)| output.secret.clone())
                .collect();

            proofs.extend(cashu::dhke::construct_proofs(
                signatures, rs, secrets, &keys,
            )?);
        }

        Ok(proofs)
    }

    async fn filter_unspent(&self, mint_url: &MintUrl, proofs: Proofs) -> Result<Proofs, Error> {
        let ys = proofs
            .iter()
            .map(Proof::y)
            .collect::<Result<Vec<_>, _>>()?;
        let states = self.client.check_state(mint_url, ys).await?;

        if states.len() != proofs.len() {
            tracing::warn!(%mint_url, "malformed checkstate response during recovery");
            return Ok(Vec::new());
        }

        Ok(proofs
            .into_iter()
            .zip(states)
            .filter(|(_, state)| state.state == MintProofState::Unspent)
            .map(|(proof, _)| proof)
            .collect())
    }

    async fn save_recovered(
        &self,
        mint_url: &MintUrl,
        unit: &CurrencyUnit,
        proofs: Proofs,
        created_by: Option<Uuid>,
    ) -> Result<Proofs, Error> {
        if proofs.is_empty() {
            return Ok(proofs);
        }

        // Proofs that already made it into the ledger stay as they are.
        let secrets: Vec<_> = proofs.iter().map(|proof| proof.secret.clone()).collect();
        let existing = self.storage.get_proofs_by_secrets(mint_url, &secrets).await?;
        let fresh: Proofs = proofs
            .into_iter()
            .filter(|proof| {
                !existing
                    .iter()
                    .any(|record| record.secret() == &proof.secret)
            })
            .collect();
        if fresh.is_empty() {
            return Ok(fresh);
        }

        let mut records = Vec::with_capacity(fresh.len());
        for proof in &fresh {
            let mut record = ProofRecord::new(
                proof.clone(),
                mint_url.clone(),
                ProofState::Ready,
                unit.clone(),
            )?;
            record.created_by_operation = created_by;
            records.push(record);
        }

        let saved_secrets: Vec<_> = records.iter().map(|r| r.secret().clone()).collect();

        let mut tx = self.storage.begin_transaction().await?;
        tx.save_proofs(records).await?;
        tx.commit().await?;

        self.events
            .emit(WalletEvent::ProofsSaved {
                mint_url: mint_url.clone(),
                secrets: saved_secrets,
                unit: unit.clone(),
            })
            .await;

        Ok(fresh)
    }

    /// Restore every keyset of a mint from the seed, walking the
    /// derivation space in batches until three consecutive batches
    /// return nothing. The counter ends at one past the highest index
    /// the mint knew; a mint that knows fewer indices than the stored
    /// counter only produces a warning.
    #[instrument(skip(self), fields(mint_url = %mint_url))]
    pub async fn restore_mint(&self, mint_url: &MintUrl) -> Result<Amount, Error> {
        let seed = (self.seed)()?;
        let keysets = self.storage.get_keysets(mint_url).await?;
        let mut restored_total = Amount::ZERO;

        for keyset in keysets {
            let Some(keys) = keyset.keys() else {
                continue;
            };

            let mut start = 0u32;
            let mut empty_batches = 0u32;
            let mut highest_seen: Option<u32> = None;

            while empty_batches < RESTORE_EMPTY_BATCHES {
                let blueprint = derive_outputs(
                    &seed,
                    keyset.id,
                    start,
                    &vec![Amount::ZERO; RESTORE_BATCH_SIZE as usize],
                )?;

                tracing::debug!(
                    keyset_id = %keyset.id,
                    start,
                    "attempting restore batch"
                );

                let response = self
                    .client
                    .restore(mint_url, blueprint.blinded_messages())
                    .await?;

                if response.signatures.is_empty() {
                    empty_batches += 1;
                    start += RESTORE_BATCH_SIZE;
                    continue;
                }
                empty_batches = 0;

                let mut matched: Vec<(&PlannedOutput, cashu::nuts::BlindSignature)> = Vec::new();
                for (returned, signature) in
                    response.outputs.iter().zip(response.signatures.clone())
                {
                    if let Some(output) = blueprint
                        .outputs
                        .iter()
                        .find(|output| output.blinded.blinded_secret == returned.blinded_secret)
                    {
                        highest_seen =
                            Some(highest_seen.map_or(output.counter, |h| h.max(output.counter)));
                        matched.push((output, signature));
                    }
                }

                let signatures: Vec<_> = matched.iter().map(|(_, sig)| sig.clone()).collect();
                let rs: Vec<SecretKey> =
                    matched.iter().map(|(output, _)| output.r.clone()).collect();
                let secrets = matched
                    .iter()
                    .map(|(output, _)| output.secret.clone())
                    .collect();
                let proofs = cashu::dhke::construct_proofs(signatures, rs, secrets, &keys)?;

                let unspent = self.filter_unspent(mint_url, proofs).await?;
                let saved = self
                    .save_recovered(mint_url, &keyset.unit, unspent, None)
                    .await?;
                restored_total = saved
                    .iter()
                    .fold(Some(restored_total), |acc, proof| {
                        acc.and_then(|total| total.checked_add(proof.amount))
                    })
                    .ok_or(Error::AmountOverflow)?;

                start += RESTORE_BATCH_SIZE;
            }

            if let Some(highest) = highest_seen {
                let target = highest + 1;
                let current = self.counters.get(mint_url, &keyset.id).await?;
                if target < current {
                    tracing::warn!(
                        keyset_id = %keyset.id,
                        stored = current,
                        restored = target,
                        "mint knows fewer outputs than the stored counter"
                    );
                } else {
                    self.counters.overwrite(mint_url, &keyset.id, target).await?;
                }
            }
        }

        Ok(restored_total)
    }

    /// Rotate wallet-controlled proofs into fresh deterministic keep
    /// proofs via a swap, marking the originals spent.
    ///
    /// The counter advance commits before the swap request goes out;
    /// if the process dies between swap and save, the outputs are
    /// still recoverable from seed.
    #[instrument(skip(self, records), fields(mint_url = %mint_url))]
    pub async fn reclaim_proofs(
        &self,
        mint_url: &MintUrl,
        unit: &CurrencyUnit,
        records: Vec<ProofRecord>,
    ) -> Result<Proofs, Error> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let wallet = self.wallets.get_wallet(mint_url, unit).await?;
        let fee = wallet.fee_for_proofs(&records)?;
        let total = Amount::try_sum(records.iter().map(ProofRecord::amount))
            .map_err(|_| Error::AmountOverflow)?;
        let reclaim_amount = total.checked_sub(fee).ok_or(Error::InsufficientBalance)?;

        let secrets: Vec<_> = records.iter().map(|r| r.secret().clone()).collect();

        if reclaim_amount == Amount::ZERO {
            let mut tx = self.storage.begin_transaction().await?;
            tx.set_proof_state(mint_url, &secrets, ProofState::Spent)
                .await?;
            tx.release_proofs(mint_url, &secrets).await?;
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let mut tx = self.storage.begin_transaction().await?;
        let plan = self
            .create_outputs_and_increment_counters(
                tx.as_mut(),
                &wallet,
                reclaim_amount,
                Amount::ZERO,
                false,
            )
            .await?;
        tx.commit().await?;
        self.events.emit_all(plan.events).await;

        let blueprint = plan.keep.ok_or_else(|| {
            Error::Custom("reclaim produced no outputs".to_string())
        })?;

        let inputs: Proofs = records.iter().map(|r| r.proof.clone()).collect();
        let response = self
            .client
            .swap(
                mint_url,
                cashu::nuts::SwapRequest::new(inputs, blueprint.blinded_messages()),
            )
            .await?;

        let keys = wallet.keys(&blueprint.keyset_id)?;
        let reclaimed = blueprint.unblind(response.signatures, &keys)?;

        let mut new_records = Vec::with_capacity(reclaimed.len());
        for proof in &reclaimed {
            new_records.push(ProofRecord::new(
                proof.clone(),
                mint_url.clone(),
                ProofState::Ready,
                unit.clone(),
            )?);
        }
        let saved_secrets: Vec<_> = new_records.iter().map(|r| r.secret().clone()).collect();

        let mut tx = self.storage.begin_transaction().await?;
        tx.set_proof_state(mint_url, &secrets, ProofState::Spent)
            .await?;
        tx.release_proofs(mint_url, &secrets).await?;
        tx.save_proofs(new_records).await?;
        tx.commit().await?;

        self.events
            .emit(WalletEvent::ProofsStateChanged {
                mint_url: mint_url.clone(),
                secrets,
                state: ProofState::Spent,
            })
            .await;
        self.events
            .emit(WalletEvent::ProofsSaved {
                mint_url: mint_url.clone(),
                secrets: saved_secrets,
                unit: unit.clone(),
            })
            .await;

        Ok(reclaimed)
    }

    /// Recovery tool: drop every proof of a keyset.
    pub async fn wipe_proofs_by_keyset(
        &self,
        mint_url: &MintUrl,
        keyset_id: &Id,
    ) -> Result<(), Error> {
        let proofs = self.storage.get_proofs(mint_url).await?;
        let secrets: Vec<_> = proofs
            .iter()
            .filter(|record| record.keyset_id() == *keyset_id)
            .map(|record| record.secret().clone())
            .collect();

        let mut tx = self.storage.begin_transaction().await?;
        tx.wipe_proofs_by_keyset(mint_url, keyset_id).await?;
        tx.commit().await?;

        self.events
            .emit(WalletEvent::ProofsDeleted {
                mint_url: mint_url.clone(),
                secrets,
            })
            .await;
        self.events
            .emit(WalletEvent::ProofsWiped {
                mint_url: mint_url.clone(),
                keyset_id: *keyset_id,
            })
            .await;

        Ok(())
    }

    /// Generate and persist a fresh P2PK keypair for receiving locked
    /// tokens.
    pub async fn create_p2pk_keypair(&self) -> Result<PublicKey, Error> {
        let secret_key = SecretKey::generate();
        let pubkey = secret_key.public_key();

        let mut tx = self.storage.begin_transaction().await?;
        tx.add_keypair(secret_key).await?;
        tx.commit().await?;

        Ok(pubkey)
    }
}
