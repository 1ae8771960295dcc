//! Audit history.

use cashu::nuts::CurrencyUnit;
use cashu::Amount;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::mint_url::MintUrl;
use crate::unix_time;

/// What a history entry records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryKind {
    /// Ecash issued against a paid invoice
    Mint {
        /// Quote the ecash was issued for
        quote_id: String,
    },
    /// Invoice paid by burning ecash
    Melt {
        /// Quote that was paid
        quote_id: String,
        /// Fee actually paid
        fee_paid: Amount,
        /// Payment preimage when the mint returned one
        preimage: Option<String>,
    },
    /// Token handed to a recipient
    Send {
        /// Input fee paid for the send
        fee: Amount,
    },
    /// Token claimed from a sender
    Receive,
}

/// One append-only audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Entry id
    pub id: Uuid,
    /// Mint the entry concerns
    pub mint_url: MintUrl,
    /// Currency unit
    pub unit: CurrencyUnit,
    /// Amount moved
    pub amount: Amount,
    /// Kind-specific detail
    #[serde(flatten)]
    pub kind: HistoryKind,
    /// Operation that produced the entry, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<Uuid>,
    /// Unix seconds the entry was written
    pub timestamp: u64,
}

impl HistoryEntry {
    /// Create a new entry stamped with the current time.
    pub fn new(
        mint_url: MintUrl,
        unit: CurrencyUnit,
        amount: Amount,
        kind: HistoryKind,
        operation_id: Option<Uuid>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            mint_url,
            unit,
            amount,
            kind,
            operation_id,
            timestamp: unix_time(),
        }
    }
}
