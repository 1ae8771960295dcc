//! Serialized deterministic output blueprints.
//!
//! A blueprint records everything needed to re-create a blinded message
//! and later unblind its signature: the derived secret, the blinding
//! factor and the counter index it was derived at. Operations persist
//! their blueprints so a crash can never orphan signatures held by the
//! mint.

use cashu::nuts::{BlindSignature, BlindedMessage, Id, Keys, Proof, SecretKey};
use cashu::secret::Secret;
use cashu::Amount;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Derive planned outputs for `amounts` at indices
/// `[counter_start, counter_start + amounts.len())`.
///
/// Secrets and blinding factors follow the deterministic derivation of
/// the keyset, so a blueprint can always be re-created from the seed
/// and a counter value.
pub fn derive_outputs(
    seed: &[u8; 64],
    keyset_id: Id,
    counter_start: u32,
    amounts: &[Amount],
) -> Result<OutputBlueprint, Error> {
    let mut outputs = Vec::with_capacity(amounts.len());

    for (i, amount) in amounts.iter().enumerate() {
        let counter = counter_start + i as u32;
        let secret = Secret::from_seed(seed, keyset_id, counter)?;
        let blinding_factor = SecretKey::from_seed(seed, keyset_id, counter)?;
        let (blinded, r) = cashu::dhke::blind_message(&secret.to_bytes(), Some(blinding_factor))?;

        outputs.push(PlannedOutput {
            amount: *amount,
            counter,
            secret,
            r,
            blinded: BlindedMessage::new(*amount, keyset_id, blinded),
        });
    }

    Ok(OutputBlueprint {
        keyset_id,
        counter_start,
        outputs,
    })
}

/// One planned deterministic output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedOutput {
    /// Value the mint is asked to sign
    pub amount: Amount,
    /// Derivation index the secret and blinding factor came from
    pub counter: u32,
    /// Derived secret
    pub secret: Secret,
    /// Blinding factor
    pub r: SecretKey,
    /// The blinded message sent to the mint
    pub blinded: BlindedMessage,
}

/// An ordered set of planned outputs for a single keyset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputBlueprint {
    /// Keyset the outputs are derived against
    pub keyset_id: Id,
    /// First derivation index used
    pub counter_start: u32,
    /// Planned outputs at indices `[counter_start, counter_start + n)`
    pub outputs: Vec<PlannedOutput>,
}

impl OutputBlueprint {
    /// Empty blueprint at a counter position.
    pub fn empty(keyset_id: Id, counter_start: u32) -> Self {
        Self {
            keyset_id,
            counter_start,
            outputs: Vec::new(),
        }
    }

    /// Number of planned outputs.
    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    /// Whether the blueprint is empty.
    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// One past the last derivation index used.
    pub fn counter_end(&self) -> u32 {
        self.counter_start + self.outputs.len() as u32
    }

    /// The blinded messages, in derivation order.
    pub fn blinded_messages(&self) -> Vec<BlindedMessage> {
        self.outputs.iter().map(|o| o.blinded.clone()).collect()
    }

    /// The derived secrets, in derivation order.
    pub fn secrets(&self) -> Vec<Secret> {
        self.outputs.iter().map(|o| o.secret.clone()).collect()
    }

    /// The blinding factors, in derivation order.
    pub fn rs(&self) -> Vec<SecretKey> {
        self.outputs.iter().map(|o| o.r.clone()).collect()
    }

    /// Total value of the planned outputs.
    pub fn total_amount(&self) -> Result<Amount, Error> {
        Amount::try_sum(self.outputs.iter().map(|o| o.amount))
            .map_err(|_| Error::AmountOverflow)
    }

    /// Unblind a full set of signatures into proofs.
    ///
    /// The signatures must be in the same order as the blueprint's
    /// outputs, which is what the mint guarantees for swap and mint
    /// responses.
    pub fn unblind(&self, signatures: Vec<BlindSignature>, keys: &Keys) -> Result<Vec<Proof>, Error> {
        if signatures.len() != self.outputs.len() {
            return Err(Error::ProofValidation(format!(
                "expected {} signatures, mint returned {}",
                self.outputs.len(),
                signatures.len()
            )));
        }

        cashu::dhke::construct_proofs(signatures, self.rs(), self.secrets(), keys)
            .map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use bip39::Mnemonic;

    use super::*;

    fn seed() -> [u8; 64] {
        Mnemonic::from_str(
            "half depart obvious quality work element tank gorilla view sugar picture humble",
        )
        .unwrap()
        .to_seed("")
    }

    #[test]
    fn derivation_matches_reference_vectors() {
        let keyset_id = Id::from_str("009a1f293253e41e").unwrap();
        let amounts = vec![Amount::from(1); 5];
        let blueprint = derive_outputs(&seed(), keyset_id, 0, &amounts).unwrap();

        let expected_secrets = [
            "485875df74771877439ac06339e284c3acfcd9be7abf3bc20b516faeadfe77ae",
            "8f2b39e8e594a4056eb1e6dbb4b0c38ef13b1b2c751f64f810ec04ee35b77270",
            "bc628c79accd2364fd31511216a0fab62afd4a18ff77a20deded7b858c9860c8",
            "59284fd1650ea9fa17db2b3acf59ecd0f2d52ec3261dd4152785813ff27a33bf",
            "576c23393a8b31cc8da6688d9c9a96394ec74b40fdaf1f693a6bb84284334ea0",
        ];

        for (planned, expected) in blueprint.outputs.iter().zip(expected_secrets) {
            assert_eq!(planned.secret, Secret::from_str(expected).unwrap());
        }
    }

    #[test]
    fn rederiving_at_same_counter_reproduces_blueprint() {
        let keyset_id = Id::from_str("009a1f293253e41e").unwrap();
        let amounts = [Amount::from(4), Amount::from(2), Amount::from(1)];

        let first = derive_outputs(&seed(), keyset_id, 7, &amounts).unwrap();
        let second = derive_outputs(&seed(), keyset_id, 7, &amounts).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.counter_end(), 10);
        assert_eq!(first.total_amount().unwrap(), Amount::from(7));
    }

    #[test]
    fn consecutive_indices_differ() {
        let keyset_id = Id::from_str("009a1f293253e41e").unwrap();
        let blueprint =
            derive_outputs(&seed(), keyset_id, 0, &[Amount::from(1), Amount::from(1)]).unwrap();

        assert_ne!(blueprint.outputs[0].secret, blueprint.outputs[1].secret);
        assert_ne!(
            blueprint.outputs[0].blinded.blinded_secret,
            blueprint.outputs[1].blinded.blinded_secret
        );
    }
}
