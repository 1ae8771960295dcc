//! Pure per-(mint, unit) wallet.
//!
//! A [`Wallet`] is a compute object built from persisted keysets: it
//! selects keysets and proofs, computes fees and builds swap payloads.
//! It never touches persistence or the network.

use cashu::nuts::{Id, Keys};
use cashu::Amount;
use satchel_common::keyset::KeysetRecord;
use satchel_common::mint_url::MintUrl;
use satchel_common::proof::ProofRecord;
use satchel_common::{CurrencyUnit, Error};

/// Per-(mint, unit) wallet view over fetched keysets.
#[derive(Debug, Clone)]
pub struct Wallet {
    mint_url: MintUrl,
    unit: CurrencyUnit,
    keysets: Vec<KeysetRecord>,
}

impl Wallet {
    /// Build a wallet from the keysets of one mint.
    ///
    /// Only keysets of the wallet's unit with fetched key material
    /// participate.
    pub fn new(
        mint_url: MintUrl,
        unit: CurrencyUnit,
        keysets: Vec<KeysetRecord>,
    ) -> Result<Self, Error> {
        let keysets: Vec<KeysetRecord> = keysets
            .into_iter()
            .filter(|keyset| {
                keyset.unit == unit
                    && keyset
                        .keypairs
                        .as_ref()
                        .is_some_and(|keypairs| !keypairs.is_empty())
            })
            .collect();

        if keysets.is_empty() {
            return Err(Error::NoActiveKeyset);
        }

        Ok(Self {
            mint_url,
            unit,
            keysets,
        })
    }

    /// The wallet's mint.
    pub fn mint_url(&self) -> &MintUrl {
        &self.mint_url
    }

    /// The wallet's unit.
    pub fn unit(&self) -> &CurrencyUnit {
        &self.unit
    }

    /// The active keyset with the lowest input fee.
    pub fn active_keyset(&self) -> Result<&KeysetRecord, Error> {
        self.keysets
            .iter()
            .filter(|keyset| keyset.active)
            .min_by_key(|keyset| (keyset.input_fee_ppk, keyset.id.to_string()))
            .ok_or(Error::NoActiveKeyset)
    }

    /// Look up a keyset by id.
    pub fn keyset(&self, keyset_id: &Id) -> Option<&KeysetRecord> {
        self.keysets.iter().find(|keyset| keyset.id == *keyset_id)
    }

    /// Protocol keys of a keyset.
    pub fn keys(&self, keyset_id: &Id) -> Result<Keys, Error> {
        self.keyset(keyset_id)
            .and_then(KeysetRecord::keys)
            .ok_or(Error::NoActiveKeyset)
    }

    /// Fee for spending `input_count` proofs of one keyset.
    pub fn fee_for_keyset(&self, keyset_id: &Id, input_count: usize) -> Result<Amount, Error> {
        let keyset = self.keyset(keyset_id).ok_or(Error::NoActiveKeyset)?;
        Ok(keyset.fee_for_inputs(input_count))
    }

    /// Fee for spending the given proofs, summed in parts-per-thousand
    /// across keysets and rounded up once.
    pub fn fee_for_proofs(&self, proofs: &[ProofRecord]) -> Result<Amount, Error> {
        let mut total_ppk: u64 = 0;
        for record in proofs {
            let keyset = self
                .keyset(&record.keyset_id())
                .ok_or(Error::NoActiveKeyset)?;
            total_ppk += keyset.input_fee_ppk;
        }
        Ok(Amount::from(total_ppk.div_ceil(1000)))
    }

    /// Try to cover `amount` exactly, without fees, preferring fewer
    /// proofs. Returns `None` when no exact cover exists along the
    /// largest-first walk.
    pub fn select_exact(
        &self,
        amount: Amount,
        available: &[ProofRecord],
    ) -> Option<Vec<ProofRecord>> {
        let mut sorted: Vec<&ProofRecord> = available.iter().collect();
        sorted.sort_by(|a, b| b.amount().cmp(&a.amount()));

        let mut remaining = u64::from(amount);
        let mut selected = Vec::new();

        for record in sorted {
            let value = u64::from(record.amount());
            if value <= remaining {
                remaining -= value;
                selected.push(record.clone());
                if remaining == 0 {
                    return Some(selected);
                }
            }
        }

        None
    }

    /// Select proofs covering `amount`, smallest first, optionally
    /// iterating until the selection also covers its own input fee.
    pub fn select_proofs(
        &self,
        amount: Amount,
        available: &[ProofRecord],
        include_fees: bool,
    ) -> Result<Vec<ProofRecord>, Error> {
        let mut sorted: Vec<&ProofRecord> = available.iter().collect();
        sorted.sort_by(|a, b| a.amount().cmp(&b.amount()));

        let mut target = u64::from(amount);

        loop {
            let mut selected = Vec::new();
            let mut sum: u64 = 0;

            for record in &sorted {
                if sum >= target {
                    break;
                }
                sum += u64::from(record.amount());
                selected.push((*record).clone());
            }

            if sum < target {
                return Err(Error::InsufficientBalance);
            }

            if !include_fees {
                return Ok(selected);
            }

            let fee = u64::from(self.fee_for_proofs(&selected)?);
            if sum >= u64::from(amount) + fee {
                return Ok(selected);
            }
            target = u64::from(amount) + fee;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::str::FromStr;

    use cashu::nuts::{Proof, PublicKey, SecretKey};
    use cashu::secret::Secret;
    use satchel_common::proof::ProofState;

    use super::*;

    fn mint_url() -> MintUrl {
        MintUrl::from_str("https://mint.example.com").unwrap()
    }

    fn keyset(id: &str, active: bool, fee_ppk: u64) -> KeysetRecord {
        let keypairs: BTreeMap<u64, PublicKey> = (0..8)
            .map(|bit| (1u64 << bit, SecretKey::generate().public_key()))
            .collect();
        KeysetRecord {
            mint_url: mint_url(),
            id: Id::from_str(id).unwrap(),
            unit: CurrencyUnit::Sat,
            active,
            input_fee_ppk: fee_ppk,
            keypairs: Some(keypairs),
        }
    }

    fn proof_record(keyset_id: &str, amount: u64) -> ProofRecord {
        let proof = Proof::new(
            Amount::from(amount),
            Id::from_str(keyset_id).unwrap(),
            Secret::generate(),
            SecretKey::generate().public_key(),
        );
        ProofRecord::new(proof, mint_url(), ProofState::Ready, CurrencyUnit::Sat).unwrap()
    }

    const KEYSET_A: &str = "00916bbf7ef91a36";
    const KEYSET_B: &str = "00916bbf7ef91a37";

    fn wallet() -> Wallet {
        Wallet::new(
            mint_url(),
            CurrencyUnit::Sat,
            vec![keyset(KEYSET_A, true, 100), keyset(KEYSET_B, true, 0)],
        )
        .unwrap()
    }

    #[test]
    fn active_keyset_is_cheapest() {
        let wallet = wallet();
        assert_eq!(
            wallet.active_keyset().unwrap().id,
            Id::from_str(KEYSET_B).unwrap()
        );
    }

    #[test]
    fn no_usable_keysets_is_an_error() {
        let mut keyset = keyset(KEYSET_A, true, 0);
        keyset.keypairs = None;
        assert!(Wallet::new(mint_url(), CurrencyUnit::Sat, vec![keyset]).is_err());
    }

    #[test]
    fn exact_selection_prefers_single_proof() {
        let wallet = wallet();
        let available = vec![proof_record(KEYSET_B, 50), proof_record(KEYSET_B, 50)];

        let selected = wallet.select_exact(Amount::from(50), &available).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].amount(), Amount::from(50));
    }

    #[test]
    fn exact_selection_fails_without_cover() {
        let wallet = wallet();
        let available = vec![proof_record(KEYSET_B, 100), proof_record(KEYSET_B, 10)];
        assert!(wallet.select_exact(Amount::from(50), &available).is_none());
    }

    #[test]
    fn selection_accumulates_smallest_first() {
        let wallet = wallet();
        let available = vec![proof_record(KEYSET_B, 100), proof_record(KEYSET_B, 10)];

        let selected = wallet
            .select_proofs(Amount::from(50), &available, true)
            .unwrap();
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn selection_covers_its_own_fee() {
        let wallet = wallet();
        let available = vec![
            proof_record(KEYSET_A, 32),
            proof_record(KEYSET_A, 16),
            proof_record(KEYSET_A, 4),
        ];

        let selected = wallet
            .select_proofs(Amount::from(48), &available, true)
            .unwrap();
        assert_eq!(selected.len(), 3);

        let sum: u64 = selected.iter().map(|p| u64::from(p.amount())).sum();
        let fee = u64::from(wallet.fee_for_proofs(&selected).unwrap());
        assert!(sum >= 48 + fee);
    }

    #[test]
    fn insufficient_balance_is_reported() {
        let wallet = wallet();
        let available = vec![proof_record(KEYSET_B, 10)];
        assert!(matches!(
            wallet.select_proofs(Amount::from(50), &available, false),
            Err(Error::InsufficientBalance)
        ));
    }

    #[test]
    fn fees_sum_across_keysets() {
        let wallet = wallet();
        let proofs = vec![
            proof_record(KEYSET_A, 1),
            proof_record(KEYSET_A, 2),
            proof_record(KEYSET_B, 4),
        ];
        // 100 + 100 + 0 = 200 ppk -> 1 sat rounded up.
        assert_eq!(wallet.fee_for_proofs(&proofs).unwrap(), Amount::from(1));
    }
}
