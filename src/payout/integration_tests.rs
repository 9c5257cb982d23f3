//! Payout Integration Tests
//!
//! Require a running PostgreSQL instance; run with `cargo test -- --ignored`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use super::gateway::{Gateway, GatewayError};
use super::service::{
    ManualReviewDecision, PayoutDestination, PayoutService, RequestPayoutCmd,
    ResolveManualReviewCmd,
};
use super::PayoutError;
use crate::domain::{Currency, PayoutStatus, TxStatus, TxType};
use crate::store;
use crate::testutil::{account_funds, create_test_account, create_test_user, test_pool};

/// Deterministic gateway: fixed outcome, counts invocations.
struct StubGateway {
    reference: Option<String>,
    calls: AtomicUsize,
}

impl StubGateway {
    fn succeeding(reference: &str) -> Self {
        Self {
            reference: Some(reference.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    fn failing() -> Self {
        Self {
            reference: None,
            calls: AtomicUsize::new(0),
        }
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Gateway for StubGateway {
    async fn send_payout(
        &self,
        _destination: &str,
        _amount_micros: i64,
        _currency: Currency,
    ) -> Result<String, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.reference {
            Some(reference) => Ok(reference.clone()),
            None => Err(GatewayError::Unavailable("gateway down".into())),
        }
    }
}

fn destination() -> PayoutDestination {
    PayoutDestination {
        iban: "GB29NWBK60161331926819".into(),
        name: "John".into(),
    }
}

async fn request(
    svc: &PayoutService,
    account_id: Uuid,
    amount_micros: i64,
) -> super::service::PayoutReceipt {
    svc.request_payout(RequestPayoutCmd {
        account_id,
        amount_micros,
        currency: Currency::Usd,
        destination: destination(),
        reference_id: format!("payout-{}", Uuid::new_v4()),
    })
    .await
    .expect("request payout")
}

#[tokio::test]
#[ignore] // Requires PostgreSQL running
async fn test_payout_success_flow() {
    let pool = test_pool().await;
    let gateway = Arc::new(StubGateway::succeeding("MOCK-REF"));
    let svc = PayoutService::new(pool.clone(), gateway.clone());

    let user = create_test_user(&pool, "payout").await;
    let account = create_test_account(&pool, user, Currency::Usd, 2_000_000).await;
    let liq_usd = Currency::Usd.system_account_id();
    let system_before = account_funds(&pool, liq_usd).await.0;

    let receipt = request(&svc, account, 500_000).await;
    assert_eq!(receipt.status, PayoutStatus::Pending);

    // Funds are reserved, not yet spent.
    assert_eq!(account_funds(&pool, account).await, (2_000_000, 500_000));

    svc.process_payouts(5).await.unwrap();

    let payout = svc.get_payout(receipt.payout_id).await.unwrap();
    assert_eq!(payout.status, PayoutStatus::Completed);
    assert_eq!(payout.gateway_ref.as_deref(), Some("MOCK-REF"));
    assert_eq!(gateway.call_count(), 1);

    let mut conn = pool.acquire().await.unwrap();
    let tx = store::get_transaction(&mut conn, payout.transaction_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tx.status, TxStatus::Completed);

    let audits = store::audit_logs_by_entity(&mut conn, "transaction", payout.transaction_id)
        .await
        .unwrap();
    let actions: Vec<&str> = audits.iter().map(|a| a.action.as_str()).collect();
    assert_eq!(
        actions,
        vec!["created", "processing_started", "payout_completed"]
    );
    drop(conn);

    assert_eq!(account_funds(&pool, account).await, (1_500_000, 0));
    assert_eq!(account_funds(&pool, liq_usd).await.0 - system_before, 500_000);
}

#[tokio::test]
#[ignore]
async fn test_payout_gateway_failure_releases_funds() {
    let pool = test_pool().await;
    let svc = PayoutService::new(pool.clone(), Arc::new(StubGateway::failing()));

    let user = create_test_user(&pool, "payout-fail").await;
    let account = create_test_account(&pool, user, Currency::Usd, 1_000_000).await;

    let receipt = request(&svc, account, 250_000).await;
    svc.process_payouts(5).await.unwrap();

    let payout = svc.get_payout(receipt.payout_id).await.unwrap();
    assert_eq!(payout.status, PayoutStatus::Failed);
    assert!(payout.gateway_ref.is_none());

    let mut conn = pool.acquire().await.unwrap();
    let tx = store::get_transaction(&mut conn, payout.transaction_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tx.status, TxStatus::Failed);
    drop(conn);

    // Balance untouched, lock fully released.
    assert_eq!(account_funds(&pool, account).await, (1_000_000, 0));
}

#[tokio::test]
#[ignore]
async fn test_payout_idempotent_request() {
    let pool = test_pool().await;
    let svc = PayoutService::new(pool.clone(), Arc::new(StubGateway::succeeding("MOCK-1")));

    let user = create_test_user(&pool, "payout-idem").await;
    let account = create_test_account(&pool, user, Currency::Usd, 1_000_000).await;

    let reference = format!("payout-{}", Uuid::new_v4());
    let cmd = RequestPayoutCmd {
        account_id: account,
        amount_micros: 100_000,
        currency: Currency::Usd,
        destination: destination(),
        reference_id: reference,
    };
    let first = svc.request_payout(cmd.clone()).await.unwrap();
    let second = svc.request_payout(cmd).await.unwrap();

    assert_eq!(first.payout_id, second.payout_id);
    // Only one reservation was placed.
    assert_eq!(account_funds(&pool, account).await.1, 100_000);
}

#[tokio::test]
#[ignore]
async fn test_stale_processing_recovery() {
    let pool = test_pool().await;
    let gateway = Arc::new(StubGateway::succeeding("MOCK-RECOVER"));
    let svc = PayoutService::new(pool.clone(), gateway.clone());

    let user = create_test_user(&pool, "payout-stale").await;
    let account = create_test_account(&pool, user, Currency::Usd, 2_000_000).await;

    let receipt = request(&svc, account, 300_000).await;

    // Simulate a worker that claimed the payout and then crashed.
    let mut conn = pool.acquire().await.unwrap();
    let payout = store::get_payout(&mut conn, receipt.payout_id)
        .await
        .unwrap()
        .unwrap();
    store::update_payout_status(&mut conn, payout.id, PayoutStatus::Processing, None)
        .await
        .unwrap();
    store::update_transaction_status(&mut conn, payout.transaction_id, TxStatus::Processing)
        .await
        .unwrap();
    sqlx::query("UPDATE payouts SET updated_at = now() - interval '3 minutes' WHERE id = $1")
        .bind(payout.id)
        .execute(&mut *conn)
        .await
        .unwrap();
    drop(conn);

    // One tick recovers the claim and completes it.
    svc.process_payouts(5).await.unwrap();

    let payout = svc.get_payout(receipt.payout_id).await.unwrap();
    assert_eq!(payout.status, PayoutStatus::Completed);
    assert_eq!(payout.gateway_ref.as_deref(), Some("MOCK-RECOVER"));
    assert_eq!(account_funds(&pool, account).await, (1_700_000, 0));
}

#[tokio::test]
#[ignore]
async fn test_concurrent_workers_never_double_send() {
    let pool = test_pool().await;
    let gateway = Arc::new(StubGateway::succeeding("MOCK-N"));
    let svc_a = PayoutService::new(pool.clone(), gateway.clone());
    let svc_b = PayoutService::new(pool.clone(), gateway.clone());

    let user = create_test_user(&pool, "payout-race").await;
    let account = create_test_account(&pool, user, Currency::Usd, 10_000_000).await;

    const PAYOUTS: usize = 5;
    for _ in 0..PAYOUTS {
        request(&svc_a, account, 100_000).await;
    }

    // Two workers race over the same queue; SKIP LOCKED partitions it.
    let (ra, rb) = tokio::join!(svc_a.process_payouts(10), svc_b.process_payouts(10));
    ra.unwrap();
    rb.unwrap();

    assert_eq!(gateway.call_count(), PAYOUTS);
    assert_eq!(account_funds(&pool, account).await, (9_500_000, 0));
}

#[tokio::test]
#[ignore]
async fn test_force_payout_failed_releases_locked_funds() {
    let pool = test_pool().await;
    let svc = PayoutService::new(pool.clone(), Arc::new(StubGateway::succeeding("MOCK-F")));

    let user = create_test_user(&pool, "payout-fallback").await;
    let account = create_test_account(&pool, user, Currency::Usd, 1_000_000).await;

    let receipt = request(&svc, account, 200_000).await;
    svc.force_payout_failed(receipt.payout_id, "forced fallback").await;

    let payout = svc.get_payout(receipt.payout_id).await.unwrap();
    assert_eq!(payout.status, PayoutStatus::Failed);

    let mut conn = pool.acquire().await.unwrap();
    let tx = store::get_transaction(&mut conn, payout.transaction_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tx.status, TxStatus::Failed);
    drop(conn);

    assert_eq!(account_funds(&pool, account).await, (1_000_000, 0));
}

async fn seed_manual_review_payout(
    pool: &sqlx::PgPool,
    account: Uuid,
    amount_micros: i64,
    gateway_ref: Option<&str>,
) -> Uuid {
    let mut conn = pool.acquire().await.unwrap();
    let tx_id = Uuid::new_v4();
    store::create_transaction(
        &mut conn,
        &store::NewTransaction {
            id: tx_id,
            amount_micros,
            currency: Currency::Usd,
            tx_type: TxType::Payout,
            status: TxStatus::Processing,
            reference_id: &format!("manual-{}", Uuid::new_v4()),
            metadata: serde_json::json!({}),
        },
    )
    .await
    .unwrap();

    let payout_id = Uuid::new_v4();
    store::insert_payout(
        &mut conn,
        payout_id,
        tx_id,
        account,
        amount_micros,
        Currency::Usd,
        PayoutStatus::ManualReview,
    )
    .await
    .unwrap();
    if gateway_ref.is_some() {
        store::update_payout_status(&mut conn, payout_id, PayoutStatus::ManualReview, gateway_ref)
            .await
            .unwrap();
    }
    store::lock_funds(&mut conn, account, amount_micros)
        .await
        .unwrap();
    payout_id
}

#[tokio::test]
#[ignore]
async fn test_resolve_manual_review_confirm_sent() {
    let pool = test_pool().await;
    let svc = PayoutService::new(pool.clone(), Arc::new(StubGateway::succeeding("unused")));

    let user = create_test_user(&pool, "manual-confirm").await;
    let account = create_test_account(&pool, user, Currency::Usd, 1_000_000).await;
    let payout_id = seed_manual_review_payout(&pool, account, 2_500, Some("GW-CONFIRM-1")).await;

    let resolved = svc
        .resolve_manual_review(ResolveManualReviewCmd {
            payout_id,
            decision: ManualReviewDecision::ConfirmSent,
            reason: "confirmed by gateway operations team".into(),
            actor_id: None,
            gateway_ref: None,
        })
        .await
        .unwrap();

    assert_eq!(resolved.status, PayoutStatus::Completed);
    assert_eq!(resolved.gateway_ref.as_deref(), Some("GW-CONFIRM-1"));
    assert_eq!(account_funds(&pool, account).await, (997_500, 0));

    let mut conn = pool.acquire().await.unwrap();
    let tx = store::get_transaction(&mut conn, resolved.transaction_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tx.status, TxStatus::Completed);
}

#[tokio::test]
#[ignore]
async fn test_resolve_manual_review_refund_failed() {
    let pool = test_pool().await;
    let svc = PayoutService::new(pool.clone(), Arc::new(StubGateway::succeeding("unused")));

    let user = create_test_user(&pool, "manual-refund").await;
    let account = create_test_account(&pool, user, Currency::Usd, 1_000_000).await;
    let payout_id = seed_manual_review_payout(&pool, account, 3_000, None).await;

    let resolved = svc
        .resolve_manual_review(ResolveManualReviewCmd {
            payout_id,
            decision: ManualReviewDecision::RefundFailed,
            reason: "provider confirmed send never happened".into(),
            actor_id: None,
            gateway_ref: None,
        })
        .await
        .unwrap();

    assert_eq!(resolved.status, PayoutStatus::Failed);
    assert_eq!(account_funds(&pool, account).await, (1_000_000, 0));
}

#[tokio::test]
#[ignore]
async fn test_resolve_rejects_non_manual_review_payout() {
    let pool = test_pool().await;
    let svc = PayoutService::new(pool.clone(), Arc::new(StubGateway::succeeding("unused")));

    let user = create_test_user(&pool, "manual-guard").await;
    let account = create_test_account(&pool, user, Currency::Usd, 1_000_000).await;
    let receipt = request(&svc, account, 100_000).await; // PENDING, not MANUAL_REVIEW

    let err = svc
        .resolve_manual_review(ResolveManualReviewCmd {
            payout_id: receipt.payout_id,
            decision: ManualReviewDecision::ConfirmSent,
            reason: "operator mistake".into(),
            actor_id: None,
            gateway_ref: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, PayoutError::NotInManualReview));
}
