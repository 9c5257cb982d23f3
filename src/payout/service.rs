//! Payout Lifecycle Engine
//!
//! Request creates a reservation (locked funds + PENDING payout). A worker
//! claims batches with SKIP LOCKED, dispatches to the gateway, and
//! finalizes. The safety property throughout: gateway success followed by
//! a local commit failure parks the payout in MANUAL_REVIEW with funds
//! still locked. Funds are never unlocked on an unknown outcome.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::watch;
use uuid::Uuid;

use super::error::PayoutError;
use super::gateway::{Gateway, GatewayError};
use crate::domain::{Currency, PayoutStatus, TxStatus, TxType};
use crate::ledger::{audit, state};
use crate::models::Payout;
use crate::observability;
use crate::store;

/// How long a PROCESSING claim may go without progress before another
/// worker may recover it.
const STALE_RECOVERY_WINDOW_SECS: i64 = 120;

const MAX_MANUAL_REVIEW_PAGE: i64 = 500;

pub struct PayoutService {
    pool: PgPool,
    gateway: Arc<dyn Gateway>,
}

/// External destination supplied by the client.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PayoutDestination {
    pub iban: String,
    pub name: String,
}

impl PayoutDestination {
    pub fn validate(&self) -> Result<(), PayoutError> {
        if self.iban.trim().is_empty() {
            return Err(PayoutError::Validation("destination.iban is required".into()));
        }
        if self.name.trim().is_empty() {
            return Err(PayoutError::Validation("destination.name is required".into()));
        }
        Ok(())
    }

    /// Single-line form handed to the gateway.
    pub fn format(&self) -> String {
        match (self.iban.is_empty(), self.name.is_empty()) {
            (true, true) => "EXTERNAL_ACCOUNT".to_string(),
            (false, true) => self.iban.clone(),
            (true, false) => self.name.clone(),
            (false, false) => format!("{} ({})", self.name, self.iban),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestPayoutCmd {
    pub account_id: Uuid,
    pub amount_micros: i64,
    pub currency: Currency,
    pub destination: PayoutDestination,
    pub reference_id: String,
}

/// Response for a payout request: 202 Accepted semantics.
#[derive(Debug, Clone, Serialize)]
pub struct PayoutReceipt {
    pub payout_id: Uuid,
    pub status: PayoutStatus,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManualReviewDecision {
    ConfirmSent,
    RefundFailed,
}

impl ManualReviewDecision {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "confirm_sent" => Some(ManualReviewDecision::ConfirmSent),
            "refund_failed" => Some(ManualReviewDecision::RefundFailed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ManualReviewDecision::ConfirmSent => "confirm_sent",
            ManualReviewDecision::RefundFailed => "refund_failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolveManualReviewCmd {
    pub payout_id: Uuid,
    pub decision: ManualReviewDecision,
    pub reason: String,
    pub actor_id: Option<Uuid>,
    pub gateway_ref: Option<String>,
}

impl PayoutService {
    pub fn new(pool: PgPool, gateway: Arc<dyn Gateway>) -> Self {
        Self { pool, gateway }
    }

    /// Create a payout reservation: lock the funds and queue a PENDING
    /// payout for the background worker. Idempotent on `reference_id`.
    pub async fn request_payout(
        &self,
        cmd: RequestPayoutCmd,
    ) -> Result<PayoutReceipt, PayoutError> {
        if cmd.amount_micros <= 0 {
            return Err(PayoutError::Validation(format!(
                "invalid amount: {}",
                cmd.amount_micros
            )));
        }
        if cmd.reference_id.is_empty() {
            return Err(PayoutError::Validation("reference_id is required".into()));
        }
        cmd.destination.validate()?;

        let mut conn = self.pool.acquire().await?;
        if let Some(existing_tx) =
            store::get_transaction_by_reference(&mut *conn, &cmd.reference_id).await?
        {
            return match store::get_payout_by_transaction(&mut *conn, existing_tx.id).await? {
                Some(payout) => Ok(PayoutReceipt {
                    payout_id: payout.id,
                    status: payout.status,
                    message: "Payout already exists".into(),
                }),
                None => Err(PayoutError::InconsistentReference(cmd.reference_id.clone())),
            };
        }
        drop(conn);

        let transaction_id = Uuid::new_v4();
        let payout_id = Uuid::new_v4();
        let metadata = serde_json::json!({ "destination": cmd.destination });

        let mut tx = self.pool.begin().await?;

        let account = store::get_account_for_update(&mut *tx, cmd.account_id)
            .await?
            .ok_or(PayoutError::Ledger(crate::ledger::LedgerError::AccountNotFound(
                cmd.account_id,
            )))?;

        if account.available_micros() < cmd.amount_micros {
            return Err(PayoutError::Ledger(
                crate::ledger::LedgerError::InsufficientFunds,
            ));
        }
        if account.currency != cmd.currency {
            return Err(PayoutError::Ledger(
                crate::ledger::LedgerError::CurrencyMismatch {
                    expected: account.currency.as_str().into(),
                    actual: cmd.currency.as_str().into(),
                },
            ));
        }

        let rows = store::lock_funds(&mut *tx, cmd.account_id, cmd.amount_micros).await?;
        store::require_exactly_one(rows, "lock account funds")?;

        store::create_transaction(
            &mut *tx,
            &store::NewTransaction {
                id: transaction_id,
                amount_micros: cmd.amount_micros,
                currency: cmd.currency,
                tx_type: TxType::Payout,
                status: TxStatus::Pending,
                reference_id: &cmd.reference_id,
                metadata: metadata.clone(),
            },
        )
        .await?;

        audit::write(
            &mut *tx,
            "transaction",
            transaction_id,
            None,
            "created",
            None,
            Some(TxStatus::Pending.as_str()),
            Some(&metadata),
        )
        .await
        .map_err(PayoutError::Ledger)?;

        store::insert_payout(
            &mut *tx,
            payout_id,
            transaction_id,
            cmd.account_id,
            cmd.amount_micros,
            cmd.currency,
            PayoutStatus::Pending,
        )
        .await?;

        tx.commit().await?;

        Ok(PayoutReceipt {
            payout_id,
            status: PayoutStatus::Pending,
            message: "Payout queued for processing".into(),
        })
    }

    /// Process one batch: recover stale claims, claim pending payouts, then
    /// dispatch each sequentially.
    pub async fn process_payouts(&self, batch_size: i64) -> Result<(), PayoutError> {
        // Shutdown channel that never fires; sender kept alive for the call.
        let (_stop_tx, stop_rx) = watch::channel(false);
        self.process_payouts_with_shutdown(batch_size, stop_rx).await
    }

    /// Like [`process_payouts`], racing the gateway call against a shutdown
    /// flag. When shutdown fires mid-batch, the current and all unattempted
    /// claims are requeued before returning; the requeue itself runs on
    /// this task and cannot be cancelled.
    pub async fn process_payouts_with_shutdown(
        &self,
        batch_size: i64,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), PayoutError> {
        self.recover_stale_processing(batch_size).await?;

        let claimed = self.claim_pending(batch_size).await?;
        if claimed.is_empty() {
            return Ok(());
        }

        for (i, payout) in claimed.iter().enumerate() {
            if *shutdown.borrow() {
                if let Err(err) = self.requeue_claimed(&claimed[i..]).await {
                    tracing::error!(error = %err, "failed to requeue claimed payouts on shutdown");
                }
                return Err(PayoutError::Cancelled);
            }

            let mut conn = self.pool.acquire().await?;
            let tx_row = match store::get_transaction(&mut *conn, payout.transaction_id).await {
                Ok(Some(tx_row)) => tx_row,
                Ok(None) | Err(_) => {
                    drop(conn);
                    self.handle_payout_failure(
                        payout.id,
                        payout.account_id,
                        payout.amount_micros,
                        "failed to fetch transaction metadata",
                    )
                    .await;
                    continue;
                }
            };
            drop(conn);

            let destination = extract_destination(&tx_row.metadata).format();

            let send = self
                .gateway
                .send_payout(&destination, payout.amount_micros, payout.currency);
            tokio::pin!(send);
            let outcome = tokio::select! {
                res = &mut send => res,
                _ = wait_for_shutdown(&mut shutdown) => Err(GatewayError::Cancelled),
            };

            match outcome {
                Err(GatewayError::Cancelled) => {
                    // Unknown outcome: back to PENDING, never FAILED. The
                    // requeue runs to completion regardless of shutdown.
                    if let Err(err) = self.requeue_claimed(&claimed[i..]).await {
                        tracing::error!(
                            error = %err,
                            payout_id = %payout.id,
                            "failed to requeue payouts after gateway cancellation"
                        );
                    }
                    return Err(PayoutError::Cancelled);
                }
                Err(GatewayError::Unavailable(reason)) => {
                    self.handle_payout_failure(
                        payout.id,
                        payout.account_id,
                        payout.amount_micros,
                        &reason,
                    )
                    .await;
                }
                Ok(gateway_ref) => {
                    if let Err(err) = self
                        .handle_payout_success(payout, &gateway_ref)
                        .await
                    {
                        tracing::error!(
                            error = %err,
                            payout_id = %payout.id,
                            gateway_ref = %gateway_ref,
                            "payout succeeded at gateway but local finalization failed; moved to manual review"
                        );
                    }
                }
            }
        }

        Ok(())
    }

    /// Reset PROCESSING payouts whose worker died between claim and
    /// finalize. SKIP LOCKED keeps live claims untouched.
    async fn recover_stale_processing(&self, batch_size: i64) -> Result<(), PayoutError> {
        let cutoff = Utc::now() - ChronoDuration::seconds(STALE_RECOVERY_WINDOW_SECS);

        let mut tx = self.pool.begin().await?;
        let stale = store::stale_processing_payouts(&mut *tx, cutoff, batch_size).await?;
        for payout in &stale {
            let rows =
                store::update_payout_status(&mut *tx, payout.id, PayoutStatus::Pending, None)
                    .await?;
            store::require_exactly_one(rows, "requeue stale payout")?;
            state::transition(
                &mut *tx,
                payout.transaction_id,
                TxStatus::Pending,
                None,
                "requeue_stale",
                None,
            )
            .await
            .map_err(PayoutError::Ledger)?;
        }
        tx.commit().await?;

        if !stale.is_empty() {
            tracing::warn!(count = stale.len(), "recovered stale processing payouts");
        }
        Ok(())
    }

    /// Claim up to `batch_size` PENDING payouts, oldest first.
    async fn claim_pending(&self, batch_size: i64) -> Result<Vec<Payout>, PayoutError> {
        let mut tx = self.pool.begin().await?;
        let mut claimed = store::claim_pending_payouts(&mut *tx, batch_size).await?;
        for payout in claimed.iter_mut() {
            let rows =
                store::update_payout_status(&mut *tx, payout.id, PayoutStatus::Processing, None)
                    .await?;
            store::require_exactly_one(rows, "mark payout processing")?;
            state::transition(
                &mut *tx,
                payout.transaction_id,
                TxStatus::Processing,
                None,
                "processing_started",
                None,
            )
            .await
            .map_err(PayoutError::Ledger)?;
            payout.status = PayoutStatus::Processing;
        }
        tx.commit().await?;
        Ok(claimed)
    }

    /// Return claimed payouts to PENDING. Runs under whatever task calls
    /// it; never raced against shutdown.
    async fn requeue_claimed(&self, payouts: &[Payout]) -> Result<(), PayoutError> {
        if payouts.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for payout in payouts {
            let rows =
                store::update_payout_status(&mut *tx, payout.id, PayoutStatus::Pending, None)
                    .await?;
            store::require_exactly_one(rows, "requeue claimed payout")?;
            state::transition(
                &mut *tx,
                payout.transaction_id,
                TxStatus::Pending,
                None,
                "requeue_claimed",
                None,
            )
            .await
            .map_err(PayoutError::Ledger)?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Finalize accounting for a gateway-confirmed payout.
    ///
    /// If the transaction here fails after the gateway succeeded, the
    /// payout is parked in MANUAL_REVIEW with funds still locked.
    async fn handle_payout_success(
        &self,
        payout: &Payout,
        gateway_ref: &str,
    ) -> Result<(), PayoutError> {
        let result = self.finalize_success(payout, gateway_ref).await;
        if let Err(err) = result {
            self.mark_payout_manual_review(payout.id, gateway_ref, &err.to_string())
                .await;
            return Err(err);
        }
        Ok(())
    }

    async fn finalize_success(
        &self,
        payout: &Payout,
        gateway_ref: &str,
    ) -> Result<(), PayoutError> {
        let mut tx = self.pool.begin().await?;

        let rows =
            store::deduct_locked_funds(&mut *tx, payout.account_id, payout.amount_micros).await?;
        store::require_exactly_one(rows, "deduct locked payout funds")?;

        let system_account = payout.currency.system_account_id();
        store::create_entry(
            &mut *tx,
            Uuid::new_v4(),
            payout.transaction_id,
            payout.account_id,
            payout.amount_micros,
            crate::domain::Direction::Debit,
        )
        .await?;
        store::create_entry(
            &mut *tx,
            Uuid::new_v4(),
            payout.transaction_id,
            system_account,
            payout.amount_micros,
            crate::domain::Direction::Credit,
        )
        .await?;

        let rows = store::adjust_balance(&mut *tx, system_account, payout.amount_micros).await?;
        store::require_exactly_one(rows, "credit system account")?;

        state::transition(
            &mut *tx,
            payout.transaction_id,
            TxStatus::Completed,
            None,
            "payout_completed",
            None,
        )
        .await
        .map_err(PayoutError::Ledger)?;

        let rows = store::update_payout_status(
            &mut *tx,
            payout.id,
            PayoutStatus::Completed,
            Some(gateway_ref),
        )
        .await?;
        store::require_exactly_one(rows, "mark payout completed")?;

        tx.commit().await?;
        Ok(())
    }

    /// Release the reservation and fail the payout after an explicit
    /// gateway error. Falls back to a lock-safe release when the single
    /// transaction itself fails.
    async fn handle_payout_failure(
        &self,
        payout_id: Uuid,
        account_id: Uuid,
        amount_micros: i64,
        reason: &str,
    ) {
        let result: Result<(), PayoutError> = async {
            let mut tx = self.pool.begin().await?;

            let rows = store::release_locked_funds(&mut *tx, account_id, amount_micros).await?;
            store::require_exactly_one(rows, "release locked payout funds")?;

            let payout = store::get_payout(&mut *tx, payout_id)
                .await?
                .ok_or(PayoutError::NotFound(payout_id))?;

            let metadata = audit::reason_metadata(reason);
            state::transition(
                &mut *tx,
                payout.transaction_id,
                TxStatus::Failed,
                None,
                "payout_failed",
                Some(&metadata),
            )
            .await
            .map_err(PayoutError::Ledger)?;

            let rows =
                store::update_payout_status(&mut *tx, payout_id, PayoutStatus::Failed, None)
                    .await?;
            store::require_exactly_one(rows, "mark payout failed")?;

            tx.commit().await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                tracing::warn!(payout_id = %payout_id, reason, "payout marked failed");
            }
            Err(err) => {
                tracing::error!(error = %err, payout_id = %payout_id, "handle payout failure failed");
                self.force_payout_failed(payout_id, &format!("{}: {}", err, reason))
                    .await;
            }
        }
    }

    /// Last-resort failure path executed outside a single transaction.
    /// The release is conditional on the lock still holding the amount, so
    /// locked_micros can never be pushed negative.
    pub(crate) async fn force_payout_failed(&self, payout_id: Uuid, reason: &str) {
        let mut conn = match self.pool.acquire().await {
            Ok(conn) => conn,
            Err(err) => {
                tracing::error!(error = %err, payout_id = %payout_id, "fallback connection acquire failed");
                return;
            }
        };

        match store::get_payout(&mut *conn, payout_id).await {
            Ok(Some(payout)) => {
                match store::release_locked_funds_safe(
                    &mut *conn,
                    payout.account_id,
                    payout.amount_micros,
                )
                .await
                {
                    Err(err) => {
                        tracing::error!(error = %err, payout_id = %payout_id, "fallback locked funds release failed");
                    }
                    Ok(released) if released > 0 => {
                        tracing::warn!(
                            payout_id = %payout_id,
                            amount_micros = payout.amount_micros,
                            "fallback released locked funds"
                        );
                    }
                    Ok(_) => {}
                }

                // Forced status write: the state machine path already failed.
                match store::update_transaction_status(
                    &mut *conn,
                    payout.transaction_id,
                    TxStatus::Failed,
                )
                .await
                {
                    Err(err) => {
                        tracing::error!(error = %err, payout_id = %payout_id, "fallback transaction fail update failed");
                    }
                    Ok(rows) => {
                        if let Err(err) = store::require_exactly_one(rows, "fallback mark transaction failed") {
                            tracing::error!(error = %err, payout_id = %payout_id, "fallback transaction fail update affected unexpected rows");
                        } else {
                            let metadata = audit::reason_metadata(reason);
                            if let Err(err) = audit::write(
                                &mut *conn,
                                "transaction",
                                payout.transaction_id,
                                None,
                                "payout_failed_fallback",
                                None,
                                Some(TxStatus::Failed.as_str()),
                                Some(&metadata),
                            )
                            .await
                            {
                                tracing::error!(error = %err, payout_id = %payout_id, "fallback audit write failed");
                            }
                        }
                    }
                }
            }
            Ok(None) => {}
            Err(err) => {
                tracing::error!(error = %err, payout_id = %payout_id, "fallback payout lookup failed");
            }
        }

        match store::update_payout_status(&mut *conn, payout_id, PayoutStatus::Failed, None).await {
            Err(err) => {
                tracing::error!(error = %err, payout_id = %payout_id, "fallback payout fail update failed");
            }
            Ok(rows) => {
                if let Err(err) = store::require_exactly_one(rows, "fallback mark payout failed") {
                    tracing::error!(error = %err, payout_id = %payout_id, "fallback payout fail update affected unexpected rows");
                }
            }
        }

        tracing::warn!(payout_id = %payout_id, reason, "payout failure fallback executed");
    }

    /// Park a payout whose gateway call succeeded but whose local commit
    /// failed. Funds stay locked until an operator resolves it.
    async fn mark_payout_manual_review(&self, payout_id: Uuid, gateway_ref: &str, reason: &str) {
        let mut conn = match self.pool.acquire().await {
            Ok(conn) => conn,
            Err(err) => {
                tracing::error!(error = %err, payout_id = %payout_id, "manual review connection acquire failed");
                return;
            }
        };

        match store::update_payout_status(
            &mut *conn,
            payout_id,
            PayoutStatus::ManualReview,
            Some(gateway_ref),
        )
        .await
        {
            Err(err) => {
                tracing::error!(error = %err, payout_id = %payout_id, "failed to mark payout manual review");
                return;
            }
            Ok(rows) => {
                if let Err(err) = store::require_exactly_one(rows, "mark payout manual review") {
                    tracing::error!(error = %err, payout_id = %payout_id, "mark payout manual review affected unexpected rows");
                    return;
                }
            }
        }
        observability::increment_manual_review_transition("queued");

        let payout = match store::get_payout(&mut *conn, payout_id).await {
            Ok(Some(payout)) => payout,
            Ok(None) | Err(_) => {
                tracing::warn!(payout_id = %payout_id, "manual review audit skipped: payout read failed");
                return;
            }
        };

        let metadata = audit::reason_metadata(reason);
        if let Err(err) = audit::write(
            &mut *conn,
            "transaction",
            payout.transaction_id,
            None,
            "payout_manual_review",
            Some(TxStatus::Processing.as_str()),
            Some(TxStatus::Processing.as_str()),
            Some(&metadata),
        )
        .await
        {
            tracing::warn!(error = %err, payout_id = %payout_id, "manual review audit write failed");
        }
    }

    pub async fn get_payout(&self, payout_id: Uuid) -> Result<Payout, PayoutError> {
        let mut conn = self.pool.acquire().await?;
        store::get_payout(&mut *conn, payout_id)
            .await?
            .ok_or(PayoutError::NotFound(payout_id))
    }

    pub async fn manual_review_queue_size(&self) -> Result<i64, PayoutError> {
        let mut conn = self.pool.acquire().await?;
        Ok(store::count_payouts_by_status(&mut *conn, PayoutStatus::ManualReview).await?)
    }

    /// Payouts waiting for an operator decision.
    pub async fn list_manual_review(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Payout>, PayoutError> {
        let limit = if limit <= 0 {
            50
        } else {
            limit.min(MAX_MANUAL_REVIEW_PAGE)
        };
        let offset = offset.max(0);

        let mut conn = self.pool.acquire().await?;
        Ok(store::payouts_by_status(&mut *conn, PayoutStatus::ManualReview, limit, offset).await?)
    }

    /// Apply an operator decision to a MANUAL_REVIEW payout.
    pub async fn resolve_manual_review(
        &self,
        cmd: ResolveManualReviewCmd,
    ) -> Result<Payout, PayoutError> {
        let mut tx = self.pool.begin().await?;

        let payout = store::get_payout_for_update(&mut *tx, cmd.payout_id)
            .await?
            .ok_or(PayoutError::NotFound(cmd.payout_id))?;
        if payout.status != PayoutStatus::ManualReview {
            return Err(PayoutError::NotInManualReview);
        }

        let metadata = audit::reason_metadata(&cmd.reason);
        match cmd.decision {
            ManualReviewDecision::ConfirmSent => {
                self.apply_manual_review_confirmation(
                    &mut tx,
                    &payout,
                    cmd.actor_id,
                    &metadata,
                    cmd.gateway_ref.as_deref(),
                )
                .await?;
            }
            ManualReviewDecision::RefundFailed => {
                self.apply_manual_review_refund(&mut tx, &payout, cmd.actor_id, &metadata)
                    .await?;
            }
        }

        tx.commit().await?;
        observability::increment_manual_review_transition(cmd.decision.as_str());
        self.get_payout(cmd.payout_id).await
    }

    async fn apply_manual_review_confirmation(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        payout: &Payout,
        actor_id: Option<Uuid>,
        metadata: &serde_json::Value,
        override_gateway_ref: Option<&str>,
    ) -> Result<(), PayoutError> {
        let rows =
            store::deduct_locked_funds(&mut **tx, payout.account_id, payout.amount_micros).await?;
        store::require_exactly_one(rows, "manual-review deduct locked funds")?;

        let system_account = payout.currency.system_account_id();
        store::create_entry(
            &mut **tx,
            Uuid::new_v4(),
            payout.transaction_id,
            payout.account_id,
            payout.amount_micros,
            crate::domain::Direction::Debit,
        )
        .await?;
        store::create_entry(
            &mut **tx,
            Uuid::new_v4(),
            payout.transaction_id,
            system_account,
            payout.amount_micros,
            crate::domain::Direction::Credit,
        )
        .await?;

        let rows = store::adjust_balance(&mut **tx, system_account, payout.amount_micros).await?;
        store::require_exactly_one(rows, "manual-review credit system account")?;

        state::transition(
            &mut **tx,
            payout.transaction_id,
            TxStatus::Completed,
            actor_id,
            "manual_review_confirmed",
            Some(metadata),
        )
        .await
        .map_err(PayoutError::Ledger)?;

        let gateway_ref = match override_gateway_ref.map(str::trim).filter(|s| !s.is_empty()) {
            Some(overridden) => Some(overridden.to_string()),
            None => payout.gateway_ref.clone(),
        };
        let rows = store::update_payout_status(
            &mut **tx,
            payout.id,
            PayoutStatus::Completed,
            gateway_ref.as_deref(),
        )
        .await?;
        store::require_exactly_one(rows, "manual-review set payout completed")?;
        Ok(())
    }

    async fn apply_manual_review_refund(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        payout: &Payout,
        actor_id: Option<Uuid>,
        metadata: &serde_json::Value,
    ) -> Result<(), PayoutError> {
        // Safe release: tolerates a lock that was already dropped.
        let rows =
            store::release_locked_funds_safe(&mut **tx, payout.account_id, payout.amount_micros)
                .await?;
        if rows > 1 {
            return Err(PayoutError::Database(format!(
                "manual-review refund released unexpected rows: {}",
                rows
            )));
        }

        state::transition(
            &mut **tx,
            payout.transaction_id,
            TxStatus::Failed,
            actor_id,
            "manual_review_refunded",
            Some(metadata),
        )
        .await
        .map_err(PayoutError::Ledger)?;

        let rows = store::update_payout_status(
            &mut **tx,
            payout.id,
            PayoutStatus::Failed,
            payout.gateway_ref.as_deref(),
        )
        .await?;
        store::require_exactly_one(rows, "manual-review set payout failed")?;
        Ok(())
    }
}

/// Destination recorded in the payout transaction's metadata.
fn extract_destination(metadata: &serde_json::Value) -> PayoutDestination {
    metadata
        .get("destination")
        .and_then(|dest| serde_json::from_value(dest.clone()).ok())
        .unwrap_or_default()
}

/// Resolves when the shutdown flag flips to true; never resolves if the
/// sender side is gone.
async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_validate() {
        let valid = PayoutDestination {
            iban: "GB29NWBK60161331926819".into(),
            name: "John".into(),
        };
        assert!(valid.validate().is_ok());

        let missing_iban = PayoutDestination {
            iban: "".into(),
            name: "John".into(),
        };
        assert!(missing_iban.validate().is_err());

        let missing_name = PayoutDestination {
            iban: "GB29NWBK60161331926819".into(),
            name: "  ".into(),
        };
        assert!(missing_name.validate().is_err());
    }

    #[test]
    fn test_destination_format() {
        let both = PayoutDestination {
            iban: "GB29NWBK60161331926819".into(),
            name: "John".into(),
        };
        assert_eq!(both.format(), "John (GB29NWBK60161331926819)");

        let iban_only = PayoutDestination {
            iban: "GB29NWBK60161331926819".into(),
            name: "".into(),
        };
        assert_eq!(iban_only.format(), "GB29NWBK60161331926819");

        let empty = PayoutDestination::default();
        assert_eq!(empty.format(), "EXTERNAL_ACCOUNT");
    }

    #[test]
    fn test_manual_review_decision_parse() {
        assert_eq!(
            ManualReviewDecision::parse("confirm_sent"),
            Some(ManualReviewDecision::ConfirmSent)
        );
        assert_eq!(
            ManualReviewDecision::parse(" REFUND_FAILED "),
            Some(ManualReviewDecision::RefundFailed)
        );
        assert_eq!(ManualReviewDecision::parse("approve"), None);
    }

    #[test]
    fn test_extract_destination() {
        let metadata = serde_json::json!({
            "destination": { "iban": "DE89370400440532013000", "name": "Jane" }
        });
        let dest = extract_destination(&metadata);
        assert_eq!(dest.iban, "DE89370400440532013000");
        assert_eq!(dest.name, "Jane");

        let empty = extract_destination(&serde_json::json!({}));
        assert_eq!(empty.format(), "EXTERNAL_ACCOUNT");
    }
}
