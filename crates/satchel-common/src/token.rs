//! Outgoing bearer tokens.

use cashu::nuts::nut00::ProofsMethods;
use cashu::nuts::{CurrencyUnit, Proofs};
use cashu::Amount;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::mint_url::MintUrl;

/// The payload handed to a recipient: the proofs of a single mint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofToken {
    /// Issuing mint
    pub mint_url: MintUrl,
    /// Currency unit of the proofs
    pub unit: CurrencyUnit,
    /// Optional memo for the recipient
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
    /// The bearer proofs
    pub proofs: Proofs,
}

impl ProofToken {
    /// Create a new token.
    pub fn new(
        mint_url: MintUrl,
        unit: CurrencyUnit,
        memo: Option<String>,
        proofs: Proofs,
    ) -> Self {
        Self {
            mint_url,
            unit,
            memo,
            proofs,
        }
    }

    /// Total value carried by the token.
    pub fn total_amount(&self) -> Result<Amount, Error> {
        self.proofs.total_amount().map_err(Error::from)
    }
}
