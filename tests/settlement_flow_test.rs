//! Integration tests for deposit generation and settlement
//!
//! Tests cover:
//! - Deposit creation and first status check scheduling
//! - Crediting a completed deposit net of the provider fee
//! - Pending results rescheduling without ledger mutation
//! - Failed and expired deposits
//! - Provider and queue failures on the deposit path
//! - Concurrent deposits never sharing a provider reference

mod common;

use chrono::Utc;
use common::{Harness, PROVIDER_FEE};
use rust_decimal_macros::dec;
use speedpay_backend::config::SettlementConfig;
use speedpay_backend::database::LedgerStore;
use speedpay_backend::domain::{Direction, SettlementStatus};
use speedpay_backend::gateway::{GatewayCall, GatewayError};
use speedpay_backend::queue::{SettlementQueue, SETTLEMENT_TASK};
use speedpay_backend::services::SettlementOutcome;
use speedpay_backend::WalletError;
use std::collections::HashSet;
use std::time::Duration;

#[tokio::test]
async fn test_deposit_creates_pending_transaction_and_one_job() {
    let harness = Harness::new();
    let user = harness.user("danielpnjt").await;
    let called_at = Utc::now();

    let deposit = harness
        .orchestrator
        .generate_deposit(&user, dec!(100000))
        .await
        .unwrap();

    let tx = harness
        .store
        .find_transaction_by_reference(&deposit.reference)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tx.status, SettlementStatus::Pending);
    assert_eq!(tx.direction, Direction::In);
    assert_eq!(tx.amount, dec!(104500));
    assert_eq!(tx.user_id, user.id);
    assert!(tx.expires_at.is_some());

    let jobs = harness.queue.scheduled().await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].reference, deposit.reference);
    assert_eq!(jobs[0].task, SETTLEMENT_TASK);
    assert!(jobs[0].eta >= called_at);
    assert_eq!(jobs[0].retry_count, SettlementConfig::default().retry_count);

    let calls = harness.gateway.calls().await;
    assert_eq!(
        calls,
        vec![GatewayCall::CreateDeposit {
            reference: deposit.reference.to_string(),
            expected_amount: dec!(100000),
        }]
    );
}

#[tokio::test]
async fn test_completed_deposit_credits_amount_minus_fee() {
    // Given: a deposit of 100000, which the provider marks up to 104500
    let harness = Harness::new();
    let user = harness.user("danielpnjt").await;
    let deposit = harness
        .orchestrator
        .generate_deposit(&user, dec!(100000))
        .await
        .unwrap();
    assert_eq!(deposit.amount, dec!(100000) + PROVIDER_FEE);

    // When: the scheduled status check runs and the provider reports COMPLETED
    let job = harness.queue.scheduled().await.unwrap().remove(0);
    let outcome = harness.orchestrator.check_settlement(&job).await.unwrap();

    // Then: exactly the requested amount lands in the balance
    assert!(matches!(
        outcome,
        SettlementOutcome::Credited { credit, .. } if credit == dec!(100000)
    ));
    assert_eq!(harness.balance(&user).await, dec!(100000));

    let tx = harness
        .store
        .find_transaction_by_reference(&deposit.reference)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tx.status, SettlementStatus::Completed);
}

#[tokio::test]
async fn test_pending_result_requeues_later_without_mutation() {
    let harness = Harness::new();
    let user = harness.user("danielpnjt").await;
    let deposit = harness
        .orchestrator
        .generate_deposit(&user, dec!(50000))
        .await
        .unwrap();
    harness
        .gateway
        .script_statuses(&deposit.reference, [SettlementStatus::Pending])
        .await;

    let job = harness
        .queue
        .claim_due(Utc::now() + chrono::Duration::hours(1))
        .await
        .unwrap()
        .unwrap();
    let outcome = harness.orchestrator.check_settlement(&job).await.unwrap();

    let SettlementOutcome::Requeued { next_eta, poll } = outcome else {
        panic!("expected requeue, got {:?}", outcome);
    };
    assert_eq!(poll, 1);
    assert!(next_eta > job.eta);

    let jobs = harness.queue.scheduled().await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].eta, next_eta);
    assert_eq!(jobs[0].reference, deposit.reference);
    assert_ne!(jobs[0].id, job.id);

    let tx = harness
        .store
        .find_transaction_by_reference(&deposit.reference)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tx.status, SettlementStatus::Pending);
    assert_eq!(harness.balance(&user).await, dec!(0));
}

#[tokio::test]
async fn test_polling_stops_after_budget() {
    let harness = Harness::with_config(SettlementConfig {
        max_polls: 2,
        ..SettlementConfig::default()
    });
    let user = harness.user("danielpnjt").await;
    let deposit = harness
        .orchestrator
        .generate_deposit(&user, dec!(50000))
        .await
        .unwrap();
    harness.gateway.set_default_status(SettlementStatus::Pending).await;

    let far_future = Utc::now() + chrono::Duration::days(1);
    let first = harness.queue.claim_due(far_future).await.unwrap().unwrap();
    assert!(matches!(
        harness.orchestrator.check_settlement(&first).await.unwrap(),
        SettlementOutcome::Requeued { poll: 1, .. }
    ));

    let second = harness.queue.claim_due(far_future).await.unwrap().unwrap();
    assert_eq!(
        harness.orchestrator.check_settlement(&second).await.unwrap(),
        SettlementOutcome::Abandoned { polls: 2 }
    );

    assert_eq!(harness.queue.len().await.unwrap(), 0);
    let tx = harness
        .store
        .find_transaction_by_reference(&deposit.reference)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tx.status, SettlementStatus::Pending);
}

#[tokio::test]
async fn test_failed_and_expired_deposits_close_without_credit() {
    for terminal in [SettlementStatus::Failed, SettlementStatus::Expired] {
        let harness = Harness::new();
        let user = harness.user("speedengine").await;
        let deposit = harness
            .orchestrator
            .generate_deposit(&user, dec!(75000))
            .await
            .unwrap();
        harness
            .gateway
            .script_statuses(&deposit.reference, [terminal])
            .await;

        let job = harness.queue.scheduled().await.unwrap().remove(0);
        let outcome = harness.orchestrator.check_settlement(&job).await.unwrap();

        assert_eq!(outcome, SettlementOutcome::Closed { status: terminal });
        assert_eq!(harness.balance(&user).await, dec!(0));
        let tx = harness
            .store
            .find_transaction_by_reference(&deposit.reference)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tx.status, terminal);
        assert_eq!(harness.queue.len().await.unwrap(), 1);
    }
}

#[tokio::test]
async fn test_amount_mismatch_is_not_credited() {
    let harness = Harness::new();
    let user = harness.user("danielpnjt").await;
    let deposit = harness
        .orchestrator
        .generate_deposit(&user, dec!(100000))
        .await
        .unwrap();
    harness
        .gateway
        .override_net_amount(&deposit.reference, dec!(10))
        .await;

    let job = harness.queue.scheduled().await.unwrap().remove(0);
    let err = harness.orchestrator.check_settlement(&job).await.unwrap_err();

    assert!(matches!(err, WalletError::AmountMismatch { .. }));
    assert!(!err.is_retryable());
    assert_eq!(harness.balance(&user).await, dec!(0));
}

#[tokio::test]
async fn test_unknown_reference_is_not_found() {
    let harness = Harness::new();
    let user = harness.user("danielpnjt").await;
    let deposit = harness
        .orchestrator
        .generate_deposit(&user, dec!(100000))
        .await
        .unwrap();

    let mut job = harness.queue.scheduled().await.unwrap().remove(0);
    job.reference = "TF-FFFzz00001".parse().unwrap();
    assert_ne!(job.reference, deposit.reference);

    let err = harness.orchestrator.check_settlement(&job).await.unwrap_err();
    assert!(matches!(err, WalletError::NotFound { .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_provider_failure_leaves_no_record() {
    // Given: the provider refuses to mint the virtual account
    let harness = Harness::new();
    let user = harness.user("danielpnjt").await;
    harness
        .gateway
        .fail_next_create(GatewayError::Rejected {
            status: 503,
            message: "maintenance".into(),
        })
        .await;

    // When: the user asks for a deposit
    let err = harness
        .orchestrator
        .generate_deposit(&user, dec!(100000))
        .await
        .unwrap_err();

    // Then: nothing was written or scheduled
    assert!(matches!(err, WalletError::PaymentProvider(_)));
    assert!(harness
        .orchestrator
        .transaction_history(&user)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(harness.queue.len().await.unwrap(), 0);
}

#[tokio::test]
async fn test_concurrent_deposits_mint_distinct_references() {
    let harness = Harness::new();
    let user = harness.user("danielpnjt").await;
    harness.gateway.set_latency(Duration::from_millis(20)).await;

    let mut handles = Vec::new();
    for _ in 0..40 {
        let orchestrator = harness.orchestrator.clone();
        let user = user.clone();
        handles.push(tokio::spawn(async move {
            orchestrator.generate_deposit(&user, dec!(10000)).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let minted: Vec<String> = harness
        .gateway
        .calls()
        .await
        .into_iter()
        .filter_map(|call| match call {
            GatewayCall::CreateDeposit { reference, .. } => Some(reference),
            _ => None,
        })
        .collect();
    let distinct: HashSet<&String> = minted.iter().collect();
    assert_eq!(minted.len(), 40);
    assert_eq!(distinct.len(), 40);
    assert_eq!(
        harness.orchestrator.transaction_history(&user).await.unwrap().len(),
        40
    );
    assert_eq!(harness.queue.len().await.unwrap(), 40);
}

#[tokio::test]
async fn test_queue_outage_does_not_fail_deposit() {
    let harness = Harness::new();
    let user = harness.user("danielpnjt").await;
    harness.queue.set_unavailable(true);

    let deposit = harness
        .orchestrator
        .generate_deposit(&user, dec!(100000))
        .await
        .unwrap();

    assert!(!deposit.check_scheduled);
    assert_eq!(deposit.status, SettlementStatus::Pending);
    let history = harness.orchestrator.transaction_history(&user).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].reference, deposit.reference);
}

#[tokio::test]
async fn test_retryable_status_error_surfaces_to_worker() {
    let harness = Harness::new();
    let user = harness.user("danielpnjt").await;
    let deposit = harness
        .orchestrator
        .generate_deposit(&user, dec!(100000))
        .await
        .unwrap();
    harness
        .gateway
        .script_failure(&deposit.reference, GatewayError::Timeout(30))
        .await;

    let job = harness.queue.scheduled().await.unwrap().remove(0);
    let err = harness.orchestrator.check_settlement(&job).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(harness.balance(&user).await, dec!(0));

    // Next run sees the default COMPLETED status and credits.
    let outcome = harness.orchestrator.check_settlement(&job).await.unwrap();
    assert!(matches!(outcome, SettlementOutcome::Credited { .. }));
    assert_eq!(harness.balance(&user).await, dec!(100000));
}

#[tokio::test]
async fn test_history_lists_newest_first() {
    let harness = Harness::new();
    let user = harness.user("danielpnjt").await;
    let first = harness
        .orchestrator
        .generate_deposit(&user, dec!(1000))
        .await
        .unwrap();
    let second = harness
        .orchestrator
        .generate_deposit(&user, dec!(2000))
        .await
        .unwrap();

    let history = harness.orchestrator.transaction_history(&user).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id, second.transaction_id);
    assert_eq!(history[1].id, first.transaction_id);
}
