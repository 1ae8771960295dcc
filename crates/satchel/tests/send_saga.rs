//! Send saga scenarios against the fake mint.

mod common;

use cashu::nuts::SecretKey;
use cashu::Amount;
use satchel::database::StorageReads;
use satchel::{Error, ProofState};
use satchel_common::operation::{SendMethod, SendState};

use common::{mint_url, unit, TestHarness};

#[tokio::test]
async fn exact_match_send_carries_inputs_and_finalizes_on_claim() {
    let harness = TestHarness::new().await;
    harness.fund(50).await;

    let counter_before = harness
        .core
        .counters()
        .get(&mint_url(), &harness.mint.keyset_id())
        .await
        .unwrap();

    let (operation, token) = harness
        .core
        .send(&mint_url(), &unit(), Amount::from(50), SendMethod::Default)
        .await
        .unwrap();

    // Exact cover: no swap, the reserved inputs are the token.
    assert_eq!(token.total_amount().unwrap(), Amount::from(50));
    let prepared = operation.prepared().unwrap();
    assert!(!prepared.needs_swap);
    assert_eq!(prepared.fee, Amount::ZERO);

    // No outputs were derived, so the counter must not move.
    let counter_after = harness
        .core
        .counters()
        .get(&mint_url(), &harness.mint.keyset_id())
        .await
        .unwrap();
    assert_eq!(counter_before, counter_after);

    // The token proofs are inflight and excluded from selection.
    assert_eq!(harness.core.balance(&mint_url()).await.unwrap(), Amount::ZERO);
    let inflight = harness.storage.get_inflight_proofs().await.unwrap();
    assert_eq!(inflight.len(), token.proofs.len());

    // The recipient claims; the operation settles.
    harness.mint.claim(&token.proofs);
    let operation = harness
        .core
        .sends()
        .recover_pending(operation)
        .await
        .unwrap();
    assert!(matches!(operation.state, SendState::Finalized(_)));

    assert_eq!(harness.core.balance(&mint_url()).await.unwrap(), Amount::ZERO);
    assert!(harness.storage.get_reserved_proofs().await.unwrap().is_empty());
}

#[tokio::test]
async fn swap_send_keeps_change_and_spends_inputs() {
    let harness = TestHarness::with_fee(100).await;
    harness.fund(110).await;

    let (operation, token) = harness
        .core
        .send(&mint_url(), &unit(), Amount::from(50), SendMethod::Default)
        .await
        .unwrap();

    let prepared = operation.prepared().unwrap();
    assert!(prepared.needs_swap);
    assert_eq!(prepared.fee, Amount::from(1));
    assert_eq!(token.total_amount().unwrap(), Amount::from(50));

    // keep = 110 - 50 - 1
    assert_eq!(
        harness.core.balance(&mint_url()).await.unwrap(),
        Amount::from(59)
    );

    // All five inputs went into the swap and are spent now.
    let proofs = harness.storage.get_proofs(&mint_url()).await.unwrap();
    let spent = proofs
        .iter()
        .filter(|record| record.state == ProofState::Spent)
        .count();
    assert_eq!(spent, 5);

    // Recipient claims, watcher-equivalent settles the operation.
    harness.mint.claim(&token.proofs);
    let operation = harness
        .core
        .sends()
        .recover_pending(operation)
        .await
        .unwrap();
    assert!(matches!(operation.state, SendState::Finalized(_)));
    assert_eq!(
        harness.core.balance(&mint_url()).await.unwrap(),
        Amount::from(59)
    );
}

#[tokio::test]
async fn send_fails_on_insufficient_balance() {
    let harness = TestHarness::new().await;
    harness.fund(10).await;

    let err = harness
        .core
        .send(&mint_url(), &unit(), Amount::from(50), SendMethod::Default)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InsufficientBalance));
}

#[tokio::test]
async fn reserved_inputs_are_invisible_to_a_second_send() {
    let harness = TestHarness::new().await;
    harness.fund(64).await;

    let (_, _token) = harness
        .core
        .send(&mint_url(), &unit(), Amount::from(64), SendMethod::Default)
        .await
        .unwrap();

    // Everything is inflight/reserved; a second send sees nothing.
    let err = harness
        .core
        .send(&mint_url(), &unit(), Amount::from(1), SendMethod::Default)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InsufficientBalance));
}

#[tokio::test]
async fn rollback_from_pending_reclaims_default_token() {
    let harness = TestHarness::with_fee(100).await;
    harness.fund(110).await;

    let (operation, token) = harness
        .core
        .send(&mint_url(), &unit(), Amount::from(50), SendMethod::Default)
        .await
        .unwrap();
    assert_eq!(
        harness.core.balance(&mint_url()).await.unwrap(),
        Amount::from(59)
    );

    let operation = harness.core.rollback_send(operation.id).await.unwrap();
    assert!(matches!(operation.state, SendState::RolledBack { .. }));

    // The 50 came back minus the reclaim swap's input fee.
    let reclaim_fee = Amount::from(1);
    assert_eq!(
        harness.core.balance(&mint_url()).await.unwrap(),
        Amount::from(59) + Amount::from(50) - reclaim_fee
    );

    // The old token is burnt at the mint.
    for proof in &token.proofs {
        assert!(harness.mint.is_spent(proof));
    }
    assert!(harness.storage.get_reserved_proofs().await.unwrap().is_empty());
}

#[tokio::test]
async fn p2pk_rollback_releases_but_cannot_reclaim() {
    let harness = TestHarness::with_fee(100).await;
    harness.fund(110).await;

    let recipient = SecretKey::generate().public_key();
    let (operation, token) = harness
        .core
        .send(
            &mint_url(),
            &unit(),
            Amount::from(50),
            SendMethod::P2pk { pubkey: recipient },
        )
        .await
        .unwrap();

    assert_eq!(token.total_amount().unwrap(), Amount::from(50));
    assert_eq!(
        harness.core.balance(&mint_url()).await.unwrap(),
        Amount::from(59)
    );

    let operation = harness.core.rollback_send(operation.id).await.unwrap();
    assert!(matches!(operation.state, SendState::RolledBack { .. }));

    // No reclaim swap happened: the locked proofs are not spent at the
    // mint and the balance stays reduced by 50 + fee.
    for proof in &token.proofs {
        assert!(!harness.mint.is_spent(proof));
    }
    assert_eq!(
        harness.core.balance(&mint_url()).await.unwrap(),
        Amount::from(59)
    );
    assert!(harness.storage.get_reserved_proofs().await.unwrap().is_empty());
}

#[tokio::test]
async fn untrusted_mint_cannot_send() {
    let harness = TestHarness::new().await;
    harness.fund(50).await;
    harness.core.mints().untrust_mint(&mint_url()).await.unwrap();

    let err = harness
        .core
        .send(&mint_url(), &unit(), Amount::from(10), SendMethod::Default)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UntrustedMint(_)));
}
