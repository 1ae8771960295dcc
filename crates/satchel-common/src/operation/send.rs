//! Send operation records.

use cashu::nuts::{CurrencyUnit, PublicKey};
use cashu::secret::Secret;
use cashu::Amount;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;
use crate::mint_url::MintUrl;
use crate::outputs::OutputBlueprint;
use crate::token::ProofToken;
use crate::unix_time;

/// How the send locks its outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SendMethod {
    /// Plain bearer send
    Default,
    /// Outputs locked to the recipient's public key
    P2pk {
        /// Recipient public key
        pubkey: PublicKey,
    },
}

impl SendMethod {
    /// Whether this method always swaps before sending.
    pub fn forces_swap(&self) -> bool {
        matches!(self, SendMethod::P2pk { .. })
    }
}

/// Everything decided during prepare.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendPrepared {
    /// Target amount to hand to the recipient
    pub amount: Amount,
    /// Send method
    #[serde(flatten)]
    pub method: SendMethod,
    /// Secrets of the reserved input proofs
    pub input_proof_secrets: Vec<Secret>,
    /// Whether a swap with the mint is required
    pub needs_swap: bool,
    /// Input fee the swap will consume
    pub fee: Amount,
    /// Blueprint for the change we keep, when swapping
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_outputs: Option<OutputBlueprint>,
    /// Blueprint for the outputs that become the token, when swapping
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_outputs: Option<OutputBlueprint>,
}

/// A send whose token is outstanding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendPending {
    /// The prepared record the send executed from
    pub prepared: SendPrepared,
    /// The token handed to the recipient
    pub token: ProofToken,
}

/// A send being cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRollback {
    /// The prepared record the send was in
    pub prepared: SendPrepared,
    /// The outstanding token, when rolling back from pending
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<ProofToken>,
}

/// Send lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SendState {
    /// Just created
    Init {
        /// Target amount
        amount: Amount,
        /// Send method
        #[serde(flatten)]
        method: SendMethod,
    },
    /// Inputs reserved, outputs planned
    Prepared(SendPrepared),
    /// Attempting the mint interaction
    Executing(SendPrepared),
    /// Token outstanding, awaiting the recipient's claim
    Pending(SendPending),
    /// All send proofs confirmed spent
    Finalized(SendPending),
    /// Cancellation in progress
    RollingBack(SendRollback),
    /// Cancelled
    RolledBack {
        /// Why the operation ended here, when not user-requested
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl SendState {
    /// Stable state tag, as persisted.
    pub fn name(&self) -> &'static str {
        match self {
            SendState::Init { .. } => "init",
            SendState::Prepared(_) => "prepared",
            SendState::Executing(_) => "executing",
            SendState::Pending(_) => "pending",
            SendState::Finalized(_) => "finalized",
            SendState::RollingBack(_) => "rolling_back",
            SendState::RolledBack { .. } => "rolled_back",
        }
    }
}

/// A persisted send operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOperation {
    /// Operation id
    pub id: Uuid,
    /// Mint the send spends from
    pub mint_url: MintUrl,
    /// Currency unit
    pub unit: CurrencyUnit,
    /// Lifecycle state
    pub state: SendState,
    /// Unix seconds created
    pub created_at: u64,
    /// Unix seconds of the last transition
    pub updated_at: u64,
}

impl SendOperation {
    /// Create a new operation in `init`.
    pub fn new(mint_url: MintUrl, unit: CurrencyUnit, amount: Amount, method: SendMethod) -> Self {
        let now = unix_time();
        Self {
            id: Uuid::new_v4(),
            mint_url,
            unit,
            state: SendState::Init { amount, method },
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to a new state, stamping `updated_at`.
    pub fn transition(&mut self, state: SendState) {
        self.state = state;
        self.updated_at = unix_time();
    }

    /// Target amount of the send.
    pub fn amount(&self) -> Amount {
        match &self.state {
            SendState::Init { amount, .. } => *amount,
            SendState::Prepared(p) | SendState::Executing(p) => p.amount,
            SendState::Pending(p) | SendState::Finalized(p) => p.prepared.amount,
            SendState::RollingBack(r) => r.prepared.amount,
            SendState::RolledBack { .. } => Amount::ZERO,
        }
    }

    /// Send method, where the state still carries one.
    pub fn method(&self) -> Option<SendMethod> {
        match &self.state {
            SendState::Init { method, .. } => Some(*method),
            SendState::Prepared(p) | SendState::Executing(p) => Some(p.method),
            SendState::Pending(p) | SendState::Finalized(p) => Some(p.prepared.method),
            SendState::RollingBack(r) => Some(r.prepared.method),
            SendState::RolledBack { .. } => None,
        }
    }

    /// The prepared record, for states that carry one.
    pub fn prepared(&self) -> Option<&SendPrepared> {
        match &self.state {
            SendState::Prepared(p) | SendState::Executing(p) => Some(p),
            SendState::Pending(p) | SendState::Finalized(p) => Some(&p.prepared),
            SendState::RollingBack(r) => Some(&r.prepared),
            _ => None,
        }
    }

    /// Whether the operation reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            SendState::Finalized(_) | SendState::RolledBack { .. }
        )
    }

    /// Reject records a storage backend should never hand out.
    pub fn validate(&self) -> Result<(), Error> {
        let inconsistent = |what: &str| {
            Err(Error::InvalidOperationState(format!(
                "send operation {} in state `{}` {}",
                self.id,
                self.state.name(),
                what
            )))
        };

        match &self.state {
            SendState::Init { amount, .. } => {
                if *amount == Amount::ZERO {
                    return inconsistent("has a zero amount");
                }
            }
            SendState::Prepared(p) | SendState::Executing(p) => {
                if p.input_proof_secrets.is_empty() {
                    return inconsistent("is missing input proof secrets");
                }
                if p.needs_swap && p.send_outputs.is_none() && !p.method.forces_swap() {
                    return inconsistent("needs a swap but has no send outputs");
                }
            }
            SendState::Pending(p) | SendState::Finalized(p) => {
                if p.token.proofs.is_empty() {
                    return inconsistent("carries an empty token");
                }
            }
            SendState::RollingBack(_) | SendState::RolledBack { .. } => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    fn mint_url() -> MintUrl {
        MintUrl::from_str("https://mint.example.com").unwrap()
    }

    #[test]
    fn init_round_trips_with_state_tag() {
        let op = SendOperation::new(
            mint_url(),
            CurrencyUnit::Sat,
            Amount::from(50),
            SendMethod::Default,
        );

        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["state"]["state"], "init");
        assert_eq!(json["state"]["method"], "default");

        let back: SendOperation = serde_json::from_value(json).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn loader_rejects_prepared_without_inputs() {
        let mut op = SendOperation::new(
            mint_url(),
            CurrencyUnit::Sat,
            Amount::from(50),
            SendMethod::Default,
        );
        op.transition(SendState::Prepared(SendPrepared {
            amount: Amount::from(50),
            method: SendMethod::Default,
            input_proof_secrets: vec![],
            needs_swap: false,
            fee: Amount::ZERO,
            keep_outputs: None,
            send_outputs: None,
        }));

        assert!(op.validate().is_err());
    }

    #[test]
    fn terminal_states() {
        let mut op = SendOperation::new(
            mint_url(),
            CurrencyUnit::Sat,
            Amount::from(50),
            SendMethod::Default,
        );
        assert!(!op.is_terminal());
        op.transition(SendState::RolledBack { reason: None });
        assert!(op.is_terminal());
    }
}
