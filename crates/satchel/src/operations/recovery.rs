//! Startup recovery.
//!
//! Runs once per process start and settles every operation the
//! previous process left behind: init operations are purged, executing
//! operations go through their crash handlers, pending operations are
//! checked against the mint, orphaned reservations are swept and
//! inflight proofs reconciled.

use std::collections::HashMap;
use std::sync::Arc;

use cashu::secret::Secret;
use satchel_common::database::WalletStorage;
use satchel_common::mint_url::MintUrl;
use satchel_common::operation::{MeltState, SendState};
use satchel_common::Error;
use tracing::instrument;
use uuid::Uuid;

use super::melt::MeltSaga;
use super::send::SendSaga;
use crate::events::{EventBus, WalletEvent};
use crate::services::ProofService;

/// What a recovery run did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Init operations deleted
    pub purged_init: usize,
    /// Executing operations run through their crash handler
    pub recovered_executing: usize,
    /// Pending operations checked against the mint
    pub checked_pending: usize,
    /// Orphaned reservations released
    pub released_orphans: usize,
}

/// Startup recovery orchestrator.
#[derive(Clone)]
pub struct RecoveryOrchestrator {
    storage: Arc<dyn WalletStorage>,
    events: Arc<EventBus>,
    send_saga: Arc<SendSaga>,
    melt_saga: Arc<MeltSaga>,
    proofs: Arc<ProofService>,
}

impl std::fmt::Debug for RecoveryOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryOrchestrator").finish_non_exhaustive()
    }
}

impl RecoveryOrchestrator {
    /// Create the orchestrator.
    pub fn new(
        storage: Arc<dyn WalletStorage>,
        events: Arc<EventBus>,
        send_saga: Arc<SendSaga>,
        melt_saga: Arc<MeltSaga>,
        proofs: Arc<ProofService>,
    ) -> Self {
        Self {
            storage,
            events,
            send_saga,
            melt_saga,
            proofs,
        }
    }

    /// Run the full recovery sequence.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<RecoveryReport, Error> {
        let mut report = RecoveryReport::default();

        report.purged_init = self.purge_init_operations().await?;
        report.recovered_executing = self.recover_executing_operations().await?;
        report.checked_pending = self.settle_pending_operations().await?;
        report.released_orphans = self.sweep_orphaned_reservations().await?;

        // Reconcile inflight proofs whose watcher subscription was
        // never re-established.
        self.proofs.check_inflight_proofs().await?;

        tracing::info!(?report, "startup recovery finished");
        Ok(report)
    }

    /// Step 1: operations that never left `init` are dropped, along
    /// with any reservation pointing at them.
    async fn purge_init_operations(&self) -> Result<usize, Error> {
        let mut purged_ids = Vec::new();

        let mut tx = self.storage.begin_transaction().await?;
        for operation in self.storage.get_send_operations().await? {
            if matches!(operation.state, SendState::Init { .. }) {
                tx.delete_send_operation(operation.id).await?;
                purged_ids.push(operation.id);
            }
        }
        for operation in self.storage.get_melt_operations().await? {
            if matches!(operation.state, MeltState::Init { .. }) {
                tx.delete_melt_operation(operation.id).await?;
                purged_ids.push(operation.id);
            }
        }
        tx.commit().await?;

        if !purged_ids.is_empty() {
            self.release_reservations_of(&purged_ids).await?;
        }

        Ok(purged_ids.len())
    }

    /// Step 2: run every `executing` operation through its crash
    /// handler. Individual failures are logged; recovery continues.
    async fn recover_executing_operations(&self) -> Result<usize, Error> {
        let mut recovered = 0;

        for operation in self.storage.get_send_operations().await? {
            match &operation.state {
                SendState::Executing(_) => {
                    recovered += 1;
                    if let Err(err) = self.send_saga.recover_executing(operation.clone()).await {
                        tracing::warn!(
                            operation_id = %operation.id,
                            "send recovery failed: {err}"
                        );
                    }
                }
                SendState::RollingBack(_) => {
                    // The reclaim outputs were derived deterministically
                    // before the crash; a restore re-creates anything
                    // the swap already produced. Close the operation.
                    recovered += 1;
                    if let Err(err) = self
                        .release_reservations_of(std::slice::from_ref(&operation.id))
                        .await
                    {
                        tracing::warn!(
                            operation_id = %operation.id,
                            "releasing rolling-back send failed: {err}"
                        );
                        continue;
                    }
                    let mut operation = operation.clone();
                    operation.transition(SendState::RolledBack {
                        reason: Some("recovered: rollback interrupted".to_string()),
                    });
                    let mut tx = match self.storage.begin_transaction().await {
                        Ok(tx) => tx,
                        Err(err) => {
                            tracing::warn!("could not open recovery transaction: {err}");
                            continue;
                        }
                    };
                    tx.upsert_send_operation(operation).await?;
                    tx.commit().await?;
                }
                _ => {}
            }
        }

        for operation in self.storage.get_melt_operations().await? {
            if matches!(operation.state, MeltState::Executing(_)) {
                recovered += 1;
                if let Err(err) = self.melt_saga.recover_executing(operation.clone()).await {
                    tracing::warn!(
                        operation_id = %operation.id,
                        "melt recovery failed: {err}"
                    );
                }
            }
        }

        Ok(recovered)
    }

    /// Step 3: check pending operations against the mint; finalize the
    /// settled ones, leave the rest pending.
    async fn settle_pending_operations(&self) -> Result<usize, Error> {
        let mut checked = 0;

        for operation in self.storage.get_send_operations().await? {
            if matches!(operation.state, SendState::Pending(_)) {
                checked += 1;
                if let Err(err) = self.send_saga.recover_pending(operation.clone()).await {
                    tracing::warn!(
                        operation_id = %operation.id,
                        "pending send check failed: {err}"
                    );
                }
            }
        }

        for operation in self.storage.get_melt_operations().await? {
            if matches!(operation.state, MeltState::Pending(_)) {
                checked += 1;
                if let Err(err) = self.melt_saga.recover_pending(operation.clone()).await {
                    tracing::warn!(
                        operation_id = %operation.id,
                        "pending melt check failed: {err}"
                    );
                }
            }
        }

        Ok(checked)
    }

    /// Step 4: release proofs whose reservation points at an operation
    /// that no longer exists or already reached a terminal state.
    async fn sweep_orphaned_reservations(&self) -> Result<usize, Error> {
        let reserved = self.storage.get_reserved_proofs().await?;
        let mut orphans: HashMap<MintUrl, Vec<Secret>> = HashMap::new();

        for record in reserved {
            let Some(operation_id) = record.used_by_operation else {
                continue;
            };

            let live = match self.storage.get_send_operation(operation_id).await? {
                Some(operation) => !operation.is_terminal(),
                None => match self.storage.get_melt_operation(operation_id).await? {
                    Some(operation) => !operation.is_terminal(),
                    None => false,
                },
            };

            if !live {
                orphans
                    .entry(record.mint_url.clone())
                    .or_default()
                    .push(record.secret().clone());
            }
        }

        let mut released = 0;
        for (mint_url, secrets) in orphans {
            released += secrets.len();

            let mut tx = self.storage.begin_transaction().await?;
            tx.release_proofs(&mint_url, &secrets).await?;
            tx.commit().await?;

            self.events
                .emit(WalletEvent::ProofsReleased { mint_url, secrets })
                .await;
        }

        Ok(released)
    }

    /// Release every proof reserved by one of the given operations.
    async fn release_reservations_of(&self, operation_ids: &[Uuid]) -> Result<(), Error> {
        let reserved = self.storage.get_reserved_proofs().await?;
        let mut by_mint: HashMap<MintUrl, Vec<Secret>> = HashMap::new();

        for record in reserved {
            if record
                .used_by_operation
                .is_some_and(|id| operation_ids.contains(&id))
            {
                by_mint
                    .entry(record.mint_url.clone())
                    .or_default()
                    .push(record.secret().clone());
            }
        }

        for (mint_url, secrets) in by_mint {
            let mut tx = self.storage.begin_transaction().await?;
            tx.release_proofs(&mint_url, &secrets).await?;
            tx.commit().await?;

            self.events
                .emit(WalletEvent::ProofsReleased { mint_url, secrets })
                .await;
        }

        Ok(())
    }
}
