//! Deposit Webhook Handler
//!
//! Signed credit events from the external payment provider. The signature
//! is `sha256=` + lowercase hex HMAC-SHA256 over the raw payload bytes,
//! verified in constant time. An empty HMAC key fails every signature
//! unless verification is explicitly skipped; there is no degrade-open.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{Currency, Direction, TxStatus, TxType};
use crate::ledger::{audit, state, LedgerError};
use crate::store;

type HmacSha256 = Hmac<Sha256>;

#[derive(Error, Debug, Clone)]
pub enum WebhookError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("unsupported currency: {0}")]
    UnsupportedCurrency(String),

    /// Same reference, different amount/currency/type.
    #[error("deposit payload does not match existing reference")]
    PayloadMismatch,

    /// The reference is still being processed by another delivery.
    #[error("deposit is still processing")]
    InProgress,

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("database error: {0}")]
    Database(String),
}

impl WebhookError {
    pub fn http_status(&self) -> u16 {
        match self {
            WebhookError::InvalidSignature => 401,
            WebhookError::InvalidPayload(_) | WebhookError::UnsupportedCurrency(_) => 400,
            WebhookError::PayloadMismatch | WebhookError::InProgress => 409,
            WebhookError::Ledger(err) => err.http_status(),
            WebhookError::Database(_) => 500,
        }
    }
}

impl From<sqlx::Error> for WebhookError {
    fn from(e: sqlx::Error) -> Self {
        WebhookError::Database(e.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct DepositPayload {
    account_id: String,
    amount_micros: i64,
    currency: String,
    reference: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DepositResponse {
    pub transaction_id: Uuid,
    pub status: TxStatus,
    pub message: String,
}

pub struct WebhookService {
    pool: PgPool,
    hmac_key: Vec<u8>,
    skip_signature: bool,
}

impl WebhookService {
    pub fn new(pool: PgPool, hmac_key: &str, skip_signature: bool) -> Self {
        Self {
            pool,
            hmac_key: hmac_key.as_bytes().to_vec(),
            skip_signature,
        }
    }

    /// Process an incoming deposit webhook: verify the signature, resolve
    /// reference idempotency, then credit the account with double-entry
    /// legs (liquidity debit, user credit) in one database transaction.
    pub async fn handle_deposit(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> Result<DepositResponse, WebhookError> {
        if !self.verify_signature(payload, signature) {
            return Err(WebhookError::InvalidSignature);
        }

        let deposit: DepositPayload = serde_json::from_slice(payload)
            .map_err(|e| WebhookError::InvalidPayload(e.to_string()))?;

        let reference = deposit.reference.trim().to_string();
        let account_raw = deposit.account_id.trim();

        if deposit.amount_micros <= 0 {
            return Err(WebhookError::InvalidPayload(format!(
                "invalid amount: {}",
                deposit.amount_micros
            )));
        }
        if reference.is_empty() {
            return Err(WebhookError::InvalidPayload("reference is required".into()));
        }
        if account_raw.is_empty() {
            return Err(WebhookError::InvalidPayload("account_id is required".into()));
        }
        let currency = Currency::parse(&deposit.currency)
            .ok_or_else(|| WebhookError::UnsupportedCurrency(deposit.currency.clone()))?;
        let account_id = Uuid::parse_str(account_raw)
            .map_err(|e| WebhookError::InvalidPayload(format!("invalid account_id: {}", e)))?;

        // Reference idempotency matrix: replay, reject, or retry.
        let mut conn = self.pool.acquire().await?;
        let existing = store::get_transaction_by_reference(&mut *conn, &reference).await?;
        drop(conn);

        let mut retry_existing = false;
        let mut transaction_id = Uuid::new_v4();
        if let Some(existing) = existing {
            if existing.tx_type != TxType::Deposit
                || existing.amount_micros != deposit.amount_micros
                || existing.currency != currency
            {
                return Err(WebhookError::PayloadMismatch);
            }
            match existing.status {
                TxStatus::Completed => {
                    return Ok(DepositResponse {
                        transaction_id: existing.id,
                        status: existing.status,
                        message: "Deposit already processed".into(),
                    });
                }
                TxStatus::Pending | TxStatus::Processing => {
                    return Err(WebhookError::InProgress);
                }
                TxStatus::Failed => {
                    retry_existing = true;
                    transaction_id = existing.id;
                }
                TxStatus::Reversed => {
                    return Err(WebhookError::InvalidPayload(format!(
                        "existing reference in unsupported state: {}",
                        existing.status
                    )));
                }
            }
        }

        let metadata = serde_json::json!({
            "webhook_reference": reference,
            "account_id": account_raw,
        });

        let result = self
            .process_deposit(
                transaction_id,
                retry_existing,
                account_id,
                deposit.amount_micros,
                currency,
                &reference,
                &metadata,
            )
            .await;

        if let Err(err) = result {
            // Best-effort FAILED marker for a fresh transaction; a retried
            // one keeps its FAILED state from the earlier attempt.
            if !retry_existing {
                self.try_mark_failed(transaction_id).await;
            }
            return Err(err);
        }

        Ok(DepositResponse {
            transaction_id,
            status: TxStatus::Completed,
            message: "Deposit processed successfully".into(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_deposit(
        &self,
        transaction_id: Uuid,
        retry_existing: bool,
        account_id: Uuid,
        amount_micros: i64,
        currency: Currency,
        reference: &str,
        metadata: &serde_json::Value,
    ) -> Result<(), WebhookError> {
        let system_account = currency.system_account_id();

        let mut tx = self.pool.begin().await?;

        let account = store::get_account_for_update(&mut *tx, account_id)
            .await?
            .ok_or(WebhookError::Ledger(LedgerError::AccountNotFound(account_id)))?;
        if account.currency != currency {
            return Err(WebhookError::Ledger(LedgerError::CurrencyMismatch {
                expected: account.currency.as_str().into(),
                actual: currency.as_str().into(),
            }));
        }

        if retry_existing {
            state::transition(
                &mut *tx,
                transaction_id,
                TxStatus::Processing,
                None,
                "retry_processing_started",
                Some(metadata),
            )
            .await?;
        } else {
            store::create_transaction(
                &mut *tx,
                &store::NewTransaction {
                    id: transaction_id,
                    amount_micros,
                    currency,
                    tx_type: TxType::Deposit,
                    status: TxStatus::Pending,
                    reference_id: reference,
                    metadata: metadata.clone(),
                },
            )
            .await
            .map_err(LedgerError::from)?;
            audit::write(
                &mut *tx,
                "transaction",
                transaction_id,
                None,
                "created",
                None,
                Some(TxStatus::Pending.as_str()),
                Some(metadata),
            )
            .await?;
            state::transition(
                &mut *tx,
                transaction_id,
                TxStatus::Processing,
                None,
                "processing_started",
                None,
            )
            .await?;
        }

        store::create_entry(
            &mut *tx,
            Uuid::new_v4(),
            transaction_id,
            system_account,
            amount_micros,
            Direction::Debit,
        )
        .await?;
        store::create_entry(
            &mut *tx,
            Uuid::new_v4(),
            transaction_id,
            account_id,
            amount_micros,
            Direction::Credit,
        )
        .await?;

        let rows = store::adjust_balance(&mut *tx, account_id, amount_micros).await?;
        store::require_exactly_one(rows, "credit deposit account")?;
        let rows = store::adjust_balance(&mut *tx, system_account, -amount_micros).await?;
        store::require_exactly_one(rows, "debit system liquidity account")?;

        state::transition(
            &mut *tx,
            transaction_id,
            TxStatus::Completed,
            None,
            "completed",
            None,
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn try_mark_failed(&self, transaction_id: Uuid) {
        let result: Result<(), WebhookError> = async {
            let mut tx = self.pool.begin().await?;
            let metadata = serde_json::json!({ "reason": "deposit_failed" });
            state::transition(
                &mut *tx,
                transaction_id,
                TxStatus::Failed,
                None,
                "failed",
                Some(&metadata),
            )
            .await?;
            tx.commit().await?;
            Ok(())
        }
        .await;

        if let Err(err) = result {
            // The insert itself may have rolled back, leaving nothing to mark.
            if !matches!(
                &err,
                WebhookError::Ledger(LedgerError::TransactionNotFound(_))
            ) {
                tracing::warn!(error = %err, transaction_id = %transaction_id, "failed to mark deposit failed");
            }
        }
    }

    /// Constant-time signature check.
    fn verify_signature(&self, payload: &[u8], signature: &str) -> bool {
        if self.skip_signature {
            return true;
        }
        if self.hmac_key.is_empty() {
            return false;
        }

        let hex_part = match signature.strip_prefix("sha256=") {
            Some(hex_part) => hex_part,
            None => return false,
        };
        let provided = match hex::decode(hex_part) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };

        let mut mac = match HmacSha256::new_from_slice(&self.hmac_key) {
            Ok(mac) => mac,
            Err(_) => return false,
        };
        mac.update(payload);
        mac.verify_slice(&provided).is_ok()
    }
}

/// Compute the signature header value for a payload. Used by tests and by
/// operators replaying deliveries.
pub fn sign_payload(key: &[u8], payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(payload);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service_with_key(key: &str) -> WebhookService {
        WebhookService {
            pool: sqlx::PgPool::connect_lazy("postgres://localhost/payflow_test")
                .expect("lazy pool"),
            hmac_key: key.as_bytes().to_vec(),
            skip_signature: false,
        }
    }

    #[tokio::test]
    async fn test_valid_signature() {
        let svc = service_with_key("topsecret");
        let payload = br#"{"account_id":"x","amount_micros":1,"currency":"USD","reference":"r"}"#;
        let sig = sign_payload(b"topsecret", payload);
        assert!(svc.verify_signature(payload, &sig));
    }

    #[tokio::test]
    async fn test_altered_payload_invalidates_signature() {
        let svc = service_with_key("topsecret");
        let payload = b"{\"amount_micros\":100}".to_vec();
        let sig = sign_payload(b"topsecret", &payload);

        let mut altered = payload.clone();
        altered[10] ^= 0x01;
        assert!(!svc.verify_signature(&altered, &sig));
    }

    #[tokio::test]
    async fn test_empty_key_fails_all_signatures() {
        let svc = service_with_key("");
        let payload = b"payload";
        // Even a signature computed with the empty key is rejected.
        let sig = sign_payload(b"", payload);
        assert!(!svc.verify_signature(payload, &sig));
    }

    #[tokio::test]
    async fn test_skip_signature_accepts_anything() {
        let mut svc = service_with_key("");
        svc.skip_signature = true;
        assert!(svc.verify_signature(b"payload", "garbage"));
    }

    #[tokio::test]
    async fn test_malformed_signature_rejected() {
        let svc = service_with_key("topsecret");
        assert!(!svc.verify_signature(b"payload", "md5=abcdef"));
        assert!(!svc.verify_signature(b"payload", "sha256=nothex!"));
        assert!(!svc.verify_signature(b"payload", ""));
    }

    #[test]
    fn test_payload_parse_normalizes_currency() {
        let raw = br#"{"account_id":" 7b7e9424-6a23-4a9e-bb1a-b9e1f9a7f111 ","amount_micros":100000,"currency":" usd ","reference":" dep-1 "}"#;
        let deposit: DepositPayload = serde_json::from_slice(raw).unwrap();
        assert_eq!(Currency::parse(&deposit.currency), Some(Currency::Usd));
        assert_eq!(deposit.reference.trim(), "dep-1");
    }
}

// Postgres-backed tests; run with `cargo test -- --ignored`.
#[cfg(test)]
mod integration_tests {
    use super::*;
    use crate::testutil::{account_funds, create_test_account, create_test_user, test_pool};

    const KEY: &str = "webhook-test-key";

    fn deposit_body(account_id: Uuid, amount_micros: i64, reference: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "account_id": account_id.to_string(),
            "amount_micros": amount_micros,
            "currency": "USD",
            "reference": reference,
        }))
        .unwrap()
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL running
    async fn test_deposit_credits_account() {
        let pool = test_pool().await;
        let svc = WebhookService::new(pool.clone(), KEY, false);

        let user = create_test_user(&pool, "deposit").await;
        let account = create_test_account(&pool, user, Currency::Usd, 0).await;
        let liq_usd = Currency::Usd.system_account_id();
        let system_before = account_funds(&pool, liq_usd).await.0;

        let reference = format!("dep-{}", Uuid::new_v4());
        let body = deposit_body(account, 250_000, &reference);
        let sig = sign_payload(KEY.as_bytes(), &body);

        let response = svc.handle_deposit(&body, &sig).await.unwrap();
        assert_eq!(response.status, TxStatus::Completed);

        assert_eq!(account_funds(&pool, account).await.0, 250_000);
        assert_eq!(account_funds(&pool, liq_usd).await.0 - system_before, -250_000);

        // Redelivery replays without a second credit.
        let replay = svc.handle_deposit(&body, &sig).await.unwrap();
        assert_eq!(replay.transaction_id, response.transaction_id);
        assert_eq!(account_funds(&pool, account).await.0, 250_000);
    }

    #[tokio::test]
    #[ignore]
    async fn test_deposit_reference_reuse_with_different_amount_conflicts() {
        let pool = test_pool().await;
        let svc = WebhookService::new(pool.clone(), KEY, false);

        let user = create_test_user(&pool, "deposit-mismatch").await;
        let account = create_test_account(&pool, user, Currency::Usd, 0).await;

        let reference = format!("dep-{}", Uuid::new_v4());
        let body = deposit_body(account, 100_000, &reference);
        let sig = sign_payload(KEY.as_bytes(), &body);
        svc.handle_deposit(&body, &sig).await.unwrap();

        let altered = deposit_body(account, 999_000, &reference);
        let altered_sig = sign_payload(KEY.as_bytes(), &altered);
        let err = svc.handle_deposit(&altered, &altered_sig).await.unwrap_err();
        assert!(matches!(err, WebhookError::PayloadMismatch));

        // No side effect from the conflicting delivery.
        assert_eq!(account_funds(&pool, account).await.0, 100_000);
    }

    #[tokio::test]
    #[ignore]
    async fn test_deposit_retries_failed_reference() {
        let pool = test_pool().await;
        let svc = WebhookService::new(pool.clone(), KEY, false);

        let user = create_test_user(&pool, "deposit-retry").await;
        let account = create_test_account(&pool, user, Currency::Usd, 0).await;

        // Pre-existing FAILED deposit for the same reference.
        let reference = format!("dep-{}", Uuid::new_v4());
        let tx_id = Uuid::new_v4();
        let mut conn = pool.acquire().await.unwrap();
        store::create_transaction(
            &mut conn,
            &store::NewTransaction {
                id: tx_id,
                amount_micros: 100_000,
                currency: Currency::Usd,
                tx_type: TxType::Deposit,
                status: TxStatus::Failed,
                reference_id: &reference,
                metadata: serde_json::json!({}),
            },
        )
        .await
        .unwrap();
        drop(conn);

        let body = deposit_body(account, 100_000, &reference);
        let sig = sign_payload(KEY.as_bytes(), &body);
        let response = svc.handle_deposit(&body, &sig).await.unwrap();

        // Transaction id is reused; the balance finally lands.
        assert_eq!(response.transaction_id, tx_id);
        assert_eq!(response.status, TxStatus::Completed);
        assert_eq!(account_funds(&pool, account).await.0, 100_000);
    }

    #[tokio::test]
    #[ignore]
    async fn test_deposit_rejects_bad_signature() {
        let pool = test_pool().await;
        let svc = WebhookService::new(pool.clone(), KEY, false);

        let user = create_test_user(&pool, "deposit-sig").await;
        let account = create_test_account(&pool, user, Currency::Usd, 0).await;

        let body = deposit_body(account, 100_000, &format!("dep-{}", Uuid::new_v4()));
        let sig = sign_payload(b"wrong-key", &body);
        let err = svc.handle_deposit(&body, &sig).await.unwrap_err();
        assert!(matches!(err, WebhookError::InvalidSignature));
        assert_eq!(account_funds(&pool, account).await.0, 0);
    }
}
