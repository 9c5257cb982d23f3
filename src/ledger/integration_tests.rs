//! Ledger Integration Tests
//!
//! Require a running PostgreSQL instance; run with `cargo test -- --ignored`.

use std::sync::Arc;

use uuid::Uuid;

use super::transfer::{ExchangeCmd, TransferService};
use super::{LedgerError, MockExchangeRateService};
use crate::domain::{Currency, Direction, TxStatus};
use crate::reconciliation::ReconciliationService;
use crate::store;
use crate::testutil::{account_funds, create_test_account, create_test_user, test_pool};

fn transfer_service(pool: &sqlx::PgPool) -> TransferService {
    TransferService::new(pool.clone(), Arc::new(MockExchangeRateService::new()))
}

#[tokio::test]
#[ignore] // Requires PostgreSQL running
async fn test_transfer_happy_path_and_replay() {
    let pool = test_pool().await;
    let svc = transfer_service(&pool);

    let user = create_test_user(&pool, "transfer").await;
    let from = create_test_account(&pool, user, Currency::Usd, 100_000_000).await;
    let to = create_test_account(&pool, user, Currency::Usd, 0).await;

    let reference = format!("xfer-{}", Uuid::new_v4());
    let tx = svc.transfer(from, to, 50_000_000, &reference).await.unwrap();
    assert_eq!(tx.status, TxStatus::Completed);
    assert_eq!(tx.amount_micros, 50_000_000);

    assert_eq!(account_funds(&pool, from).await.0, 50_000_000);
    assert_eq!(account_funds(&pool, to).await.0, 50_000_000);

    // Exactly two ledger legs.
    let mut conn = pool.acquire().await.unwrap();
    let entries = store::entries_for_transaction(&mut conn, tx.id).await.unwrap();
    assert_eq!(entries.len(), 2);
    let debits: i64 = entries
        .iter()
        .filter(|e| e.direction == Direction::Debit)
        .map(|e| e.amount_micros)
        .sum();
    let credits: i64 = entries
        .iter()
        .filter(|e| e.direction == Direction::Credit)
        .map(|e| e.amount_micros)
        .sum();
    assert_eq!(debits, credits);

    let audits = store::audit_logs_by_entity(&mut conn, "transaction", tx.id)
        .await
        .unwrap();
    let actions: Vec<&str> = audits.iter().map(|a| a.action.as_str()).collect();
    assert_eq!(actions, vec!["created", "processing_started", "completed"]);
    drop(conn);

    // Replay with the same reference: same transaction, no balance change.
    let replay = svc.transfer(from, to, 50_000_000, &reference).await.unwrap();
    assert_eq!(replay.id, tx.id);
    assert_eq!(account_funds(&pool, from).await.0, 50_000_000);
    assert_eq!(account_funds(&pool, to).await.0, 50_000_000);
}

#[tokio::test]
#[ignore]
async fn test_transfer_insufficient_funds() {
    let pool = test_pool().await;
    let svc = transfer_service(&pool);

    let user = create_test_user(&pool, "poor").await;
    let from = create_test_account(&pool, user, Currency::Usd, 1_000).await;
    let to = create_test_account(&pool, user, Currency::Usd, 0).await;

    let err = svc
        .transfer(from, to, 5_000, &format!("xfer-{}", Uuid::new_v4()))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientFunds));

    assert_eq!(account_funds(&pool, from).await.0, 1_000);
    assert_eq!(account_funds(&pool, to).await.0, 0);
}

#[tokio::test]
#[ignore]
async fn test_transfer_currency_mismatch() {
    let pool = test_pool().await;
    let svc = transfer_service(&pool);

    let user = create_test_user(&pool, "mixed").await;
    let from = create_test_account(&pool, user, Currency::Usd, 1_000_000).await;
    let to = create_test_account(&pool, user, Currency::Eur, 0).await;

    let err = svc
        .transfer(from, to, 1_000, &format!("xfer-{}", Uuid::new_v4()))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::CurrencyMismatch { .. }));
}

#[tokio::test]
#[ignore]
async fn test_transfer_validation() {
    let pool = test_pool().await;
    let svc = transfer_service(&pool);
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();

    assert!(matches!(
        svc.transfer(a, b, 0, "ref").await.unwrap_err(),
        LedgerError::InvalidAmount
    ));
    assert!(matches!(
        svc.transfer(a, b, 100, "").await.unwrap_err(),
        LedgerError::ReferenceRequired
    ));
    assert!(matches!(
        svc.transfer(a, a, 100, "ref").await.unwrap_err(),
        LedgerError::SameAccount
    ));
}

#[tokio::test]
#[ignore]
async fn test_exchange_four_leg_balances() {
    let pool = test_pool().await;
    let svc = transfer_service(&pool);

    let user = create_test_user(&pool, "fx").await;
    let from = create_test_account(&pool, user, Currency::Usd, 100_000_000).await;
    let to = create_test_account(&pool, user, Currency::Eur, 0).await;

    let liq_usd = Currency::Usd.system_account_id();
    let liq_eur = Currency::Eur.system_account_id();
    let usd_before = account_funds(&pool, liq_usd).await.0;
    let eur_before = account_funds(&pool, liq_eur).await.0;

    let tx = svc
        .exchange(ExchangeCmd {
            from_account_id: from,
            to_account_id: to,
            amount_micros: 100_000_000,
            from_currency: Currency::Usd,
            to_currency: Currency::Eur,
            reference_id: format!("fx-{}", Uuid::new_v4()),
        })
        .await
        .unwrap();

    assert_eq!(tx.status, TxStatus::Completed);
    assert!(tx.fx_rate.is_some());
    assert_eq!(tx.metadata["target_amount"], 92_000_000);

    // USD -> EUR at 0.92: sender drained, receiver gets 92 EUR, liquidity
    // absorbs the legs (EUR side goes short).
    assert_eq!(account_funds(&pool, from).await.0, 0);
    assert_eq!(account_funds(&pool, to).await.0, 92_000_000);
    assert_eq!(account_funds(&pool, liq_usd).await.0 - usd_before, 100_000_000);
    assert_eq!(account_funds(&pool, liq_eur).await.0 - eur_before, -92_000_000);

    let mut conn = pool.acquire().await.unwrap();
    let entries = store::entries_for_transaction(&mut conn, tx.id).await.unwrap();
    assert_eq!(entries.len(), 4);
}

#[tokio::test]
#[ignore]
async fn test_exchange_same_currency_rejected() {
    let pool = test_pool().await;
    let svc = transfer_service(&pool);

    let err = svc
        .exchange(ExchangeCmd {
            from_account_id: Uuid::new_v4(),
            to_account_id: Uuid::new_v4(),
            amount_micros: 1_000,
            from_currency: Currency::Usd,
            to_currency: Currency::Usd,
            reference_id: "fx-same".into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::SameCurrencyExchange));
}

#[tokio::test]
#[ignore]
async fn test_concurrent_bidirectional_transfers_conserve_funds() {
    let pool = test_pool().await;

    let user = create_test_user(&pool, "concurrent").await;
    let a = create_test_account(&pool, user, Currency::Usd, 50_000_000).await;
    let b = create_test_account(&pool, user, Currency::Usd, 50_000_000).await;

    const ROUNDS: usize = 25;
    let svc_ab = transfer_service(&pool);
    let svc_ba = transfer_service(&pool);

    let run = Uuid::new_v4();
    let forward = async {
        for i in 0..ROUNDS {
            svc_ab
                .transfer(a, b, 1_000, &format!("fwd-{}-{}", run, i))
                .await
                .expect("forward transfer should not deadlock or fail");
        }
    };
    let backward = async {
        for i in 0..ROUNDS {
            svc_ba
                .transfer(b, a, 1_000, &format!("bwd-{}-{}", run, i))
                .await
                .expect("backward transfer should not deadlock or fail");
        }
    };
    tokio::join!(forward, backward);

    // Equal flow both ways: totals conserved and individually unchanged.
    assert_eq!(account_funds(&pool, a).await.0, 50_000_000);
    assert_eq!(account_funds(&pool, b).await.0, 50_000_000);
}

#[tokio::test]
#[ignore]
async fn test_global_ledger_balanced() {
    let pool = test_pool().await;
    let svc = transfer_service(&pool);

    let user = create_test_user(&pool, "net").await;
    let from = create_test_account(&pool, user, Currency::Usd, 10_000_000).await;
    let to = create_test_account(&pool, user, Currency::Usd, 0).await;
    svc.transfer(from, to, 2_500_000, &format!("net-{}", Uuid::new_v4()))
        .await
        .unwrap();

    let mut conn = pool.acquire().await.unwrap();
    assert_eq!(store::ledger_net(&mut conn).await.unwrap(), 0);
    assert!(store::ledger_currency_imbalances(&mut conn)
        .await
        .unwrap()
        .is_empty());
    drop(conn);

    // Reconciliation reports success on a balanced ledger.
    let recon = ReconciliationService::new(pool.clone());
    assert!(recon.run().await.is_ok());
}
