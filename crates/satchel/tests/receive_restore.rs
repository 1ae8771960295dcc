//! Receive and seed-restore flows.

mod common;

use cashu::Amount;
use satchel::Error;
use satchel_common::operation::SendMethod;

use common::{mint_url, unit, TestHarness};

#[tokio::test]
async fn receive_swaps_incoming_proofs_into_fresh_ones() {
    let harness = TestHarness::new().await;
    harness.fund(110).await;

    let (_, token) = harness
        .core
        .send(&mint_url(), &unit(), Amount::from(50), SendMethod::Default)
        .await
        .unwrap();
    assert_eq!(
        harness.core.balance(&mint_url()).await.unwrap(),
        Amount::from(60)
    );

    let received = harness.core.receive(token.clone()).await.unwrap();
    assert_eq!(received, Amount::from(50));
    assert_eq!(
        harness.core.balance(&mint_url()).await.unwrap(),
        Amount::from(110)
    );

    // The incoming proofs were burnt at the mint during the claim swap.
    for proof in &token.proofs {
        assert!(harness.mint.is_spent(proof));
    }
}

#[tokio::test]
async fn receive_signs_p2pk_locked_proofs_with_keyring_key() {
    let harness = TestHarness::new().await;
    harness.fund(110).await;

    let receive_key = harness.core.p2pk_receive_key().await.unwrap();
    let (_, token) = harness
        .core
        .send(
            &mint_url(),
            &unit(),
            Amount::from(50),
            SendMethod::P2pk {
                pubkey: receive_key,
            },
        )
        .await
        .unwrap();

    // The locked proofs carry a witness after preparation and the
    // claim swap goes through.
    let received = harness.core.receive(token).await.unwrap();
    assert_eq!(received, Amount::from(50));
    assert_eq!(
        harness.core.balance(&mint_url()).await.unwrap(),
        Amount::from(110)
    );
}

#[tokio::test]
async fn receive_rejects_locks_to_unknown_keys() {
    let harness = TestHarness::new().await;
    harness.fund(110).await;

    let foreign = cashu::nuts::SecretKey::generate().public_key();
    let (_, token) = harness
        .core
        .send(
            &mint_url(),
            &unit(),
            Amount::from(50),
            SendMethod::P2pk { pubkey: foreign },
        )
        .await
        .unwrap();

    let err = harness.core.receive(token).await.unwrap_err();
    assert!(matches!(err, Error::ProofValidation(_)));
}

#[tokio::test]
async fn receive_requires_a_trusted_mint() {
    let harness = TestHarness::new().await;
    harness.fund(64).await;

    let (_, token) = harness
        .core
        .send(&mint_url(), &unit(), Amount::from(64), SendMethod::Default)
        .await
        .unwrap();

    harness.core.mints().untrust_mint(&mint_url()).await.unwrap();
    let err = harness.core.receive(token).await.unwrap_err();
    assert!(matches!(err, Error::UntrustedMint(_)));
}

#[tokio::test]
async fn restore_rebuilds_wiped_proofs_from_seed() {
    let harness = TestHarness::new().await;
    harness.fund(100).await;

    let keyset_id = harness.mint.keyset_id();
    let counter_before = harness
        .core
        .counters()
        .get(&mint_url(), &keyset_id)
        .await
        .unwrap();
    assert!(counter_before > 0);

    // Lose the local ledger.
    harness
        .core
        .proofs()
        .wipe_proofs_by_keyset(&mint_url(), &keyset_id)
        .await
        .unwrap();
    assert_eq!(harness.core.balance(&mint_url()).await.unwrap(), Amount::ZERO);

    // The seed plus the mint's restore endpoint bring everything back.
    let restored = harness.core.restore(&mint_url()).await.unwrap();
    assert_eq!(restored, Amount::from(100));
    assert_eq!(
        harness.core.balance(&mint_url()).await.unwrap(),
        Amount::from(100)
    );

    // The counter never went backwards.
    let counter_after = harness
        .core
        .counters()
        .get(&mint_url(), &keyset_id)
        .await
        .unwrap();
    assert!(counter_after >= counter_before);
}

#[tokio::test]
async fn restore_skips_spent_outputs() {
    let harness = TestHarness::new().await;
    harness.fund(100).await;

    // Spend 36 in a token the recipient claims.
    let (operation, token) = harness
        .core
        .send(&mint_url(), &unit(), Amount::from(36), SendMethod::Default)
        .await
        .unwrap();
    harness.mint.claim(&token.proofs);
    harness
        .core
        .sends()
        .recover_pending(operation)
        .await
        .unwrap();

    let keyset_id = harness.mint.keyset_id();
    harness
        .core
        .proofs()
        .wipe_proofs_by_keyset(&mint_url(), &keyset_id)
        .await
        .unwrap();

    // Only the unspent remainder comes back.
    let restored = harness.core.restore(&mint_url()).await.unwrap();
    assert_eq!(restored, Amount::from(64));
}

#[tokio::test]
async fn counters_survive_mint_and_send_cycles() {
    let harness = TestHarness::new().await;
    let keyset_id = harness.mint.keyset_id();

    let mut last = 0;
    for amount in [30u64, 50, 70] {
        harness.fund(amount).await;
        let counter = harness
            .core
            .counters()
            .get(&mint_url(), &keyset_id)
            .await
            .unwrap();
        assert!(counter > last, "counter must advance on every issue");
        last = counter;
    }
}
