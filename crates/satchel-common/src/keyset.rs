//! Keyset records.

use std::collections::BTreeMap;

use cashu::nuts::{CurrencyUnit, Id, Keys, PublicKey};
use cashu::Amount;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::mint_url::MintUrl;

/// A mint keyset as stored locally.
///
/// Key material is fetched once when the keyset is first seen and is
/// immutable afterwards; only `active` and `input_fee_ppk` follow the
/// mint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysetRecord {
    /// Owning mint
    pub mint_url: MintUrl,
    /// Keyset id
    pub id: Id,
    /// Currency unit, e.g. "sat"
    pub unit: CurrencyUnit,
    /// Whether the mint currently signs with this keyset
    pub active: bool,
    /// Input fee in parts-per-thousand per proof spent
    pub input_fee_ppk: u64,
    /// Denomination -> mint public key, present once keys were fetched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keypairs: Option<BTreeMap<u64, PublicKey>>,
}

impl KeysetRecord {
    /// Attach fetched key material, validating every denomination is a
    /// positive power of two.
    pub fn with_keypairs(mut self, keypairs: BTreeMap<u64, PublicKey>) -> Result<Self, Error> {
        for denomination in keypairs.keys() {
            if *denomination == 0 || !denomination.is_power_of_two() {
                return Err(Error::Validation(format!(
                    "keyset {} denomination {} is not a positive power of two",
                    self.id, denomination
                )));
            }
        }
        self.keypairs = Some(keypairs);
        Ok(self)
    }

    /// The keyset's keys in the protocol representation, if fetched.
    pub fn keys(&self) -> Option<Keys> {
        self.keypairs.as_ref().map(|keypairs| {
            Keys::new(
                keypairs
                    .iter()
                    .map(|(amount, pk)| (Amount::from(*amount), *pk))
                    .collect(),
            )
        })
    }

    /// Mint public key for a denomination.
    pub fn key_for_amount(&self, amount: Amount) -> Option<PublicKey> {
        self.keypairs
            .as_ref()
            .and_then(|keypairs| keypairs.get(&u64::from(amount)).copied())
    }

    /// Fee in base units for spending `input_count` proofs of this
    /// keyset, rounded up from parts-per-thousand.
    pub fn fee_for_inputs(&self, input_count: usize) -> Amount {
        let ppk = self.input_fee_ppk * input_count as u64;
        Amount::from(ppk.div_ceil(1000))
    }
}
