//! Melt operation records.

use cashu::nuts::CurrencyUnit;
use cashu::secret::Secret;
use cashu::Amount;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;
use crate::mint_url::MintUrl;
use crate::outputs::OutputBlueprint;
use crate::unix_time;

/// Everything decided during melt prepare.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeltPrepared {
    /// Quote being paid
    pub quote_id: String,
    /// Invoice amount
    pub amount: Amount,
    /// Mint's Lightning fee reserve
    pub fee_reserve: Amount,
    /// Input fee of the pre-melt swap, zero when melting directly
    pub swap_fee: Amount,
    /// Whether a pre-melt swap is required
    pub needs_swap: bool,
    /// Secrets of the reserved input proofs
    pub input_proof_secrets: Vec<Secret>,
    /// Blank outputs the mint returns Lightning fee change into
    pub change_outputs: OutputBlueprint,
    /// Blueprint for the change we keep from the pre-melt swap
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_outputs: Option<OutputBlueprint>,
    /// Blueprint for the exact-total proofs the pre-melt swap produces
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_outputs: Option<OutputBlueprint>,
}

/// Melt lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MeltState {
    /// Just created
    Init {
        /// Quote being paid
        quote_id: String,
        /// Invoice amount
        amount: Amount,
    },
    /// Inputs reserved, outputs planned
    Prepared(MeltPrepared),
    /// Attempting the mint interaction
    Executing(MeltPrepared),
    /// Mint reported the Lightning payment in flight
    Pending(MeltPrepared),
    /// Payment settled
    Finalized {
        /// Quote that was paid
        quote_id: String,
        /// Payment preimage when the mint returned one
        #[serde(default, skip_serializing_if = "Option::is_none")]
        preimage: Option<String>,
        /// Change returned into the blank outputs
        change_amount: Amount,
    },
    /// Payment failed, inputs reclaimed
    Failed {
        /// Why the melt failed
        reason: String,
    },
}

impl MeltState {
    /// Stable state tag, as persisted.
    pub fn name(&self) -> &'static str {
        match self {
            MeltState::Init { .. } => "init",
            MeltState::Prepared(_) => "prepared",
            MeltState::Executing(_) => "executing",
            MeltState::Pending(_) => "pending",
            MeltState::Finalized { .. } => "finalized",
            MeltState::Failed { .. } => "failed",
        }
    }
}

/// A persisted melt operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeltOperation {
    /// Operation id
    pub id: Uuid,
    /// Mint the melt spends from
    pub mint_url: MintUrl,
    /// Currency unit
    pub unit: CurrencyUnit,
    /// Lifecycle state
    pub state: MeltState,
    /// Unix seconds created
    pub created_at: u64,
    /// Unix seconds of the last transition
    pub updated_at: u64,
}

impl MeltOperation {
    /// Create a new operation in `init`.
    pub fn new(mint_url: MintUrl, unit: CurrencyUnit, quote_id: String, amount: Amount) -> Self {
        let now = unix_time();
        Self {
            id: Uuid::new_v4(),
            mint_url,
            unit,
            state: MeltState::Init { quote_id, amount },
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to a new state, stamping `updated_at`.
    pub fn transition(&mut self, state: MeltState) {
        self.state = state;
        self.updated_at = unix_time();
    }

    /// The quote this melt pays.
    pub fn quote_id(&self) -> &str {
        match &self.state {
            MeltState::Init { quote_id, .. } => quote_id,
            MeltState::Prepared(p) | MeltState::Executing(p) | MeltState::Pending(p) => {
                &p.quote_id
            }
            MeltState::Finalized { quote_id, .. } => quote_id,
            MeltState::Failed { .. } => "",
        }
    }

    /// The prepared record, for states that carry one.
    pub fn prepared(&self) -> Option<&MeltPrepared> {
        match &self.state {
            MeltState::Prepared(p) | MeltState::Executing(p) | MeltState::Pending(p) => Some(p),
            _ => None,
        }
    }

    /// Whether the operation reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            MeltState::Finalized { .. } | MeltState::Failed { .. }
        )
    }

    /// Reject records a storage backend should never hand out.
    pub fn validate(&self) -> Result<(), Error> {
        match &self.state {
            MeltState::Prepared(p) | MeltState::Executing(p) | MeltState::Pending(p) => {
                if p.input_proof_secrets.is_empty() {
                    return Err(Error::InvalidOperationState(format!(
                        "melt operation {} in state `{}` is missing input proof secrets",
                        self.id,
                        self.state.name()
                    )));
                }
                if p.needs_swap && p.send_outputs.is_none() {
                    return Err(Error::InvalidOperationState(format!(
                        "melt operation {} needs a swap but has no swap blueprints",
                        self.id
                    )));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use cashu::nuts::Id;

    use super::*;

    #[test]
    fn prepared_without_swap_blueprints_is_rejected() {
        let mut op = MeltOperation::new(
            MintUrl::from_str("https://mint.example.com").unwrap(),
            CurrencyUnit::Sat,
            "quote-1".to_string(),
            Amount::from(100),
        );

        op.transition(MeltState::Prepared(MeltPrepared {
            quote_id: "quote-1".to_string(),
            amount: Amount::from(100),
            fee_reserve: Amount::from(10),
            swap_fee: Amount::ZERO,
            needs_swap: true,
            input_proof_secrets: vec![Secret::generate()],
            change_outputs: OutputBlueprint::empty(Id::from_str("00916bbf7ef91a36").unwrap(), 0),
            keep_outputs: None,
            send_outputs: None,
        }));

        assert!(op.validate().is_err());

        if let MeltState::Prepared(prepared) = &mut op.state {
            prepared.needs_swap = false;
        }
        assert!(op.validate().is_ok());
    }
}
