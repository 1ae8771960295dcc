//! Melt saga scenarios against the fake mint.

mod common;

use cashu::Amount;
use satchel::database::StorageReads;
use satchel::ProofState;
use satchel_common::history::HistoryKind;
use satchel_common::operation::MeltState;

use common::{mint_url, unit, MeltBehavior, TestHarness};

#[tokio::test]
async fn overshooting_selection_swaps_then_melts() {
    let harness = TestHarness::with_fee(100).await;
    harness.fund(200).await;

    harness.mint.set_next_melt_quote(100, 10);
    let quote = harness
        .core
        .melt_quote(&mint_url(), &unit(), "lnbc-fake-invoice".to_string())
        .await
        .unwrap();

    // 200 available against a total of 110: over the 1.1 threshold.
    let operation = harness
        .core
        .melt(&mint_url(), &unit(), &quote.id)
        .await
        .unwrap();

    let MeltState::Finalized {
        preimage,
        change_amount,
        ..
    } = &operation.state
    else {
        panic!("melt did not finalize: {:?}", operation.state);
    };
    assert!(preimage.is_some());
    // The fake Lightning payment is free, so the whole fee reserve
    // returns as change.
    assert_eq!(*change_amount, Amount::from(10));

    // keep (200 - 110 - 1 swap fee) plus returned change.
    assert_eq!(
        harness.core.balance(&mint_url()).await.unwrap(),
        Amount::from(99)
    );

    // The melt is in the audit log with zero Lightning fee paid.
    let history = harness.core.history(Some(&mint_url())).await.unwrap();
    let melt_entry = history
        .iter()
        .find(|entry| matches!(entry.kind, HistoryKind::Melt { .. }))
        .expect("melt history entry");
    match &melt_entry.kind {
        HistoryKind::Melt {
            quote_id, fee_paid, ..
        } => {
            assert_eq!(quote_id, &quote.id);
            assert_eq!(*fee_paid, Amount::ZERO);
        }
        _ => unreachable!(),
    }

    assert!(harness.storage.get_reserved_proofs().await.unwrap().is_empty());
}

#[tokio::test]
async fn tight_selection_melts_directly() {
    let harness = TestHarness::new().await;
    harness.fund(110).await;

    harness.mint.set_next_melt_quote(100, 10);
    let quote = harness
        .core
        .melt_quote(&mint_url(), &unit(), "lnbc-fake-invoice".to_string())
        .await
        .unwrap();

    let operation = harness
        .core
        .melt(&mint_url(), &unit(), &quote.id)
        .await
        .unwrap();

    let prepared_was_direct = match &operation.state {
        MeltState::Finalized { change_amount, .. } => {
            assert_eq!(*change_amount, Amount::from(10));
            true
        }
        other => panic!("melt did not finalize: {other:?}"),
    };
    assert!(prepared_was_direct);

    // 110 in, 100 paid, 10 change.
    assert_eq!(
        harness.core.balance(&mint_url()).await.unwrap(),
        Amount::from(10)
    );

    // The original inputs are spent, not recycled.
    let proofs = harness.storage.get_proofs(&mint_url()).await.unwrap();
    let spent = proofs
        .iter()
        .filter(|record| record.state == ProofState::Spent)
        .count();
    assert_eq!(spent, 5);
}

#[tokio::test]
async fn unpaid_melt_returns_inputs() {
    let harness = TestHarness::new().await;
    harness.fund(110).await;

    harness.mint.set_next_melt_quote(100, 10);
    harness.mint.set_melt_behavior(MeltBehavior::Unpaid);

    let quote = harness
        .core
        .melt_quote(&mint_url(), &unit(), "lnbc-fake-invoice".to_string())
        .await
        .unwrap();
    let operation = harness
        .core
        .melt(&mint_url(), &unit(), &quote.id)
        .await
        .unwrap();

    assert!(matches!(operation.state, MeltState::Failed { .. }));
    assert_eq!(
        harness.core.balance(&mint_url()).await.unwrap(),
        Amount::from(110)
    );
    assert!(harness.storage.get_reserved_proofs().await.unwrap().is_empty());
}

#[tokio::test]
async fn pending_melt_stays_pending() {
    let harness = TestHarness::new().await;
    harness.fund(110).await;

    harness.mint.set_next_melt_quote(100, 10);
    harness.mint.set_melt_behavior(MeltBehavior::Pending);

    let quote = harness
        .core
        .melt_quote(&mint_url(), &unit(), "lnbc-fake-invoice".to_string())
        .await
        .unwrap();
    let operation = harness
        .core
        .melt(&mint_url(), &unit(), &quote.id)
        .await
        .unwrap();

    assert!(matches!(operation.state, MeltState::Pending(_)));
    // Nothing is spendable while the Lightning payment is in flight.
    assert_eq!(harness.core.balance(&mint_url()).await.unwrap(), Amount::ZERO);
}
