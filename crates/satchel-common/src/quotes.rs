//! Locally mirrored mint and melt quote state machines.
//!
//! The mint owns these state machines; the wallet mirrors the last
//! observed state so that watchers and recovery can act without a
//! round-trip.

use std::fmt;
use std::str::FromStr;

use cashu::nuts::CurrencyUnit;
use cashu::Amount;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::mint_url::MintUrl;
use crate::unix_time;

/// State of a bolt11 mint quote: `UNPAID -> PAID -> ISSUED`.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MintQuoteState {
    /// Invoice not yet paid
    Unpaid,
    /// Invoice paid, ecash not yet issued
    Paid,
    /// Ecash issued, terminal
    Issued,
}

impl fmt::Display for MintQuoteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MintQuoteState::Unpaid => write!(f, "UNPAID"),
            MintQuoteState::Paid => write!(f, "PAID"),
            MintQuoteState::Issued => write!(f, "ISSUED"),
        }
    }
}

impl FromStr for MintQuoteState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UNPAID" => Ok(MintQuoteState::Unpaid),
            "PAID" => Ok(MintQuoteState::Paid),
            "ISSUED" => Ok(MintQuoteState::Issued),
            other => Err(Error::Validation(format!(
                "unknown mint quote state `{other}`"
            ))),
        }
    }
}

/// State of a bolt11 melt quote: `UNPAID -> PENDING -> PAID`.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MeltQuoteState {
    /// Payment not attempted or failed back to unpaid
    Unpaid,
    /// Lightning payment in flight
    Pending,
    /// Payment settled, terminal
    Paid,
}

impl fmt::Display for MeltQuoteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeltQuoteState::Unpaid => write!(f, "UNPAID"),
            MeltQuoteState::Pending => write!(f, "PENDING"),
            MeltQuoteState::Paid => write!(f, "PAID"),
        }
    }
}

impl FromStr for MeltQuoteState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UNPAID" => Ok(MeltQuoteState::Unpaid),
            "PENDING" => Ok(MeltQuoteState::Pending),
            "PAID" => Ok(MeltQuoteState::Paid),
            other => Err(Error::Validation(format!(
                "unknown melt quote state `{other}`"
            ))),
        }
    }
}

/// Mint quote info
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintQuote {
    /// Quote id issued by the mint
    pub id: String,
    /// Owning mint
    pub mint_url: MintUrl,
    /// Amount to be issued
    pub amount: Amount,
    /// Currency unit of the quote
    pub unit: CurrencyUnit,
    /// bolt11 payment request
    pub request: String,
    /// Last observed state
    pub state: MintQuoteState,
    /// Expiration time of quote, unix seconds
    pub expiry: u64,
    /// Unix seconds the quote was created locally
    pub created_at: u64,
}

impl MintQuote {
    /// Create a new unpaid mint quote mirror.
    pub fn new(
        id: String,
        mint_url: MintUrl,
        amount: Amount,
        unit: CurrencyUnit,
        request: String,
        expiry: u64,
    ) -> Self {
        Self {
            id,
            mint_url,
            amount,
            unit,
            request,
            state: MintQuoteState::Unpaid,
            expiry,
            created_at: unix_time(),
        }
    }

    /// Whether the quote still needs watching.
    pub fn is_pending(&self) -> bool {
        self.state != MintQuoteState::Issued
    }

    /// Whether the quote has expired.
    pub fn is_expired(&self, now: u64) -> bool {
        self.expiry != 0 && now > self.expiry
    }
}

/// Melt quote info
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeltQuote {
    /// Quote id issued by the mint
    pub id: String,
    /// Owning mint
    pub mint_url: MintUrl,
    /// Currency unit of the quote
    pub unit: CurrencyUnit,
    /// Amount of the invoice
    pub amount: Amount,
    /// Reserve the mint holds for Lightning fees
    pub fee_reserve: Amount,
    /// bolt11 payment request being paid
    pub request: String,
    /// Last observed state
    pub state: MeltQuoteState,
    /// Expiration time of quote, unix seconds
    pub expiry: u64,
    /// Payment preimage once the mint reports PAID
    pub payment_preimage: Option<String>,
    /// Unix seconds the quote was created locally
    pub created_at: u64,
}

impl MeltQuote {
    /// Amount plus fee reserve, the total of inputs a melt must cover.
    pub fn total(&self) -> Result<Amount, Error> {
        self.amount
            .checked_add(self.fee_reserve)
            .ok_or(Error::AmountOverflow)
    }

    /// Whether the quote still needs watching.
    pub fn is_pending(&self) -> bool {
        self.state != MeltQuoteState::Paid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_states_use_wire_casing() {
        assert_eq!(
            serde_json::to_string(&MintQuoteState::Unpaid).unwrap(),
            "\"UNPAID\""
        );
        assert_eq!(
            serde_json::from_str::<MeltQuoteState>("\"PENDING\"").unwrap(),
            MeltQuoteState::Pending
        );
        assert!(MintQuoteState::from_str("paid").is_err());
    }
}
