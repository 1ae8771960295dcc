//! Proof ledger records.

use std::fmt;
use std::str::FromStr;

use cashu::nuts::{CurrencyUnit, Id, Proof, PublicKey};
use cashu::secret::Secret;
use cashu::Amount;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;
use crate::mint_url::MintUrl;

/// Local state of a bearer proof.
///
/// Transitions are `ready -> inflight -> spent` or `inflight -> ready`
/// on rollback. `spent` is terminal.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofState {
    /// Spendable by a new operation, unless reserved
    Ready,
    /// In a send token awaiting claim, or mid-swap
    Inflight,
    /// The mint confirmed the underlying Y as spent
    Spent,
}

impl fmt::Display for ProofState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProofState::Ready => write!(f, "ready"),
            ProofState::Inflight => write!(f, "inflight"),
            ProofState::Spent => write!(f, "spent"),
        }
    }
}

impl FromStr for ProofState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(ProofState::Ready),
            "inflight" => Ok(ProofState::Inflight),
            "spent" => Ok(ProofState::Spent),
            other => Err(Error::Validation(format!("unknown proof state `{other}`"))),
        }
    }
}

/// A proof together with its ledger bookkeeping.
///
/// Unique by `(mint_url, proof.secret)`; the repository rejects
/// double-inserts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofRecord {
    /// The bearer proof
    pub proof: Proof,
    /// `hash_to_curve(secret)`, the mint's identifier for the proof
    pub y: PublicKey,
    /// Issuing mint
    pub mint_url: MintUrl,
    /// Ledger state
    pub state: ProofState,
    /// Currency unit of the proof's keyset
    pub unit: CurrencyUnit,
    /// Live operation that reserved this proof, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_by_operation: Option<Uuid>,
    /// Operation that created this proof, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by_operation: Option<Uuid>,
}

impl ProofRecord {
    /// Create a new [`ProofRecord`], computing the proof's Y.
    pub fn new(
        proof: Proof,
        mint_url: MintUrl,
        state: ProofState,
        unit: CurrencyUnit,
    ) -> Result<Self, Error> {
        let y = proof.y()?;

        Ok(Self {
            proof,
            y,
            mint_url,
            state,
            unit,
            used_by_operation: None,
            created_by_operation: None,
        })
    }

    /// Tag the record with the operation that created it.
    pub fn created_by(mut self, operation_id: Uuid) -> Self {
        self.created_by_operation = Some(operation_id);
        self
    }

    /// The proof's secret.
    pub fn secret(&self) -> &Secret {
        &self.proof.secret
    }

    /// The proof's amount.
    pub fn amount(&self) -> Amount {
        self.proof.amount
    }

    /// The proof's keyset id.
    pub fn keyset_id(&self) -> Id {
        self.proof.keyset_id
    }

    /// Whether a new operation may select this proof.
    pub fn is_available(&self) -> bool {
        self.state == ProofState::Ready && self.used_by_operation.is_none()
    }
}
