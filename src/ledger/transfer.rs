//! Ledger / Transfer Engine
//!
//! Same-currency transfers and four-leg FX exchanges. Every operation is a
//! single database transaction that writes ledger entries, balance updates,
//! the state machine and the audit trail atomically.
//!
//! Deadlock avoidance: account row locks are always acquired in ascending
//! id order, on every code path.

use std::sync::Arc;

use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use super::audit;
use super::error::LedgerError;
use super::rates::ExchangeRateService;
use super::state;
use crate::domain::money::Money;
use crate::domain::{Currency, Direction, TxStatus, TxType};
use crate::models::Transaction;
use crate::store;

pub struct TransferService {
    pool: PgPool,
    rates: Arc<dyn ExchangeRateService>,
}

/// Parameters for a cross-currency exchange.
#[derive(Debug, Clone)]
pub struct ExchangeCmd {
    pub from_account_id: Uuid,
    pub to_account_id: Uuid,
    pub amount_micros: i64,
    pub from_currency: Currency,
    pub to_currency: Currency,
    pub reference_id: String,
}

impl TransferService {
    pub fn new(pool: PgPool, rates: Arc<dyn ExchangeRateService>) -> Self {
        Self { pool, rates }
    }

    /// Process a same-currency transfer between two accounts.
    ///
    /// Idempotent on `reference_id`: a replay returns the existing
    /// transaction without side effects, including when the replay loses a
    /// commit race and only surfaces as a unique violation.
    pub async fn transfer(
        &self,
        from_account_id: Uuid,
        to_account_id: Uuid,
        amount_micros: i64,
        reference_id: &str,
    ) -> Result<Transaction, LedgerError> {
        if amount_micros <= 0 {
            return Err(LedgerError::InvalidAmount);
        }
        if reference_id.is_empty() {
            return Err(LedgerError::ReferenceRequired);
        }
        if from_account_id == to_account_id {
            return Err(LedgerError::SameAccount);
        }

        let mut conn = self.pool.acquire().await?;
        if let Some(existing) =
            store::get_transaction_by_reference(&mut *conn, reference_id).await?
        {
            return Ok(existing);
        }
        drop(conn);

        let transaction_id = Uuid::new_v4();
        let result = self
            .transfer_in_tx(transaction_id, from_account_id, to_account_id, amount_micros, reference_id)
            .await;

        match result {
            Ok(tx) => Ok(tx),
            // Lost a reference-id race at commit: treat as a late replay.
            Err(LedgerError::DuplicateReference) => {
                let mut conn = self.pool.acquire().await?;
                store::get_transaction_by_reference(&mut *conn, reference_id)
                    .await?
                    .ok_or(LedgerError::DuplicateReference)
            }
            Err(err) => Err(err),
        }
    }

    async fn transfer_in_tx(
        &self,
        transaction_id: Uuid,
        from_account_id: Uuid,
        to_account_id: Uuid,
        amount_micros: i64,
        reference_id: &str,
    ) -> Result<Transaction, LedgerError> {
        let mut tx = self.pool.begin().await?;

        // Lock accounts in a stable order to avoid deadlocks.
        let (first, second) = if from_account_id < to_account_id {
            (from_account_id, to_account_id)
        } else {
            (to_account_id, from_account_id)
        };
        store::lock_account(&mut *tx, first)
            .await?
            .ok_or(LedgerError::AccountNotFound(first))?;
        store::lock_account(&mut *tx, second)
            .await?
            .ok_or(LedgerError::AccountNotFound(second))?;

        let (from_balance, from_currency) =
            store::get_account_balance_and_currency(&mut *tx, from_account_id)
                .await?
                .ok_or(LedgerError::AccountNotFound(from_account_id))?;
        let to_currency = store::get_account_currency(&mut *tx, to_account_id)
            .await?
            .ok_or(LedgerError::AccountNotFound(to_account_id))?;

        if from_currency != to_currency {
            return Err(LedgerError::CurrencyMismatch {
                expected: from_currency.as_str().into(),
                actual: to_currency.as_str().into(),
            });
        }
        if from_balance < amount_micros {
            return Err(LedgerError::InsufficientFunds);
        }

        store::create_transaction(
            &mut *tx,
            &store::NewTransaction {
                id: transaction_id,
                amount_micros,
                currency: from_currency,
                tx_type: TxType::Transfer,
                status: TxStatus::Pending,
                reference_id,
                metadata: serde_json::json!({}),
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
            None,
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

        store::create_entry(
            &mut *tx,
            Uuid::new_v4(),
            transaction_id,
            from_account_id,
            amount_micros,
            Direction::Debit,
        )
        .await?;
        store::create_entry(
            &mut *tx,
            Uuid::new_v4(),
            transaction_id,
            to_account_id,
            amount_micros,
            Direction::Credit,
        )
        .await?;

        let rows = store::adjust_balance(&mut *tx, from_account_id, -amount_micros).await?;
        store::require_exactly_one(rows, "debit sender account")?;
        let rows = store::adjust_balance(&mut *tx, to_account_id, amount_micros).await?;
        store::require_exactly_one(rows, "credit receiver account")?;

        state::transition(
            &mut *tx,
            transaction_id,
            TxStatus::Completed,
            None,
            "completed",
            None,
        )
        .await?;

        let created = store::get_transaction(&mut *tx, transaction_id)
            .await?
            .ok_or(LedgerError::TransactionNotFound(transaction_id))?;
        tx.commit().await?;
        Ok(created)
    }

    /// Process a cross-currency exchange through the liquidity accounts.
    ///
    /// Writes four ledger legs: user debit and liquidity credit in the
    /// source currency, liquidity debit and user credit in the target
    /// currency. The target liquidity balance may go negative (open FX
    /// position).
    pub async fn exchange(&self, cmd: ExchangeCmd) -> Result<Transaction, LedgerError> {
        if cmd.amount_micros <= 0 {
            return Err(LedgerError::InvalidAmount);
        }
        if cmd.reference_id.is_empty() {
            return Err(LedgerError::ReferenceRequired);
        }
        if cmd.from_account_id == cmd.to_account_id {
            return Err(LedgerError::SameAccount);
        }
        if cmd.from_currency == cmd.to_currency {
            return Err(LedgerError::SameCurrencyExchange);
        }

        let mut conn = self.pool.acquire().await?;
        if let Some(existing) =
            store::get_transaction_by_reference(&mut *conn, &cmd.reference_id).await?
        {
            return Ok(existing);
        }
        drop(conn);

        let rate = self
            .rates
            .get_exchange_rate(cmd.from_currency, cmd.to_currency)
            .await?;
        if rate <= Decimal::ZERO {
            return Err(LedgerError::RateUnavailable {
                from: cmd.from_currency.as_str().into(),
                to: cmd.to_currency.as_str().into(),
            });
        }

        let transaction_id = Uuid::new_v4();
        match self.exchange_in_tx(transaction_id, &cmd, rate).await {
            Ok(tx) => Ok(tx),
            Err(LedgerError::DuplicateReference) => {
                let mut conn = self.pool.acquire().await?;
                store::get_transaction_by_reference(&mut *conn, &cmd.reference_id)
                    .await?
                    .ok_or(LedgerError::DuplicateReference)
            }
            Err(err) => Err(err),
        }
    }

    async fn exchange_in_tx(
        &self,
        transaction_id: Uuid,
        cmd: &ExchangeCmd,
        rate: Decimal,
    ) -> Result<Transaction, LedgerError> {
        let liq_source = cmd.from_currency.system_account_id();
        let liq_target = cmd.to_currency.system_account_id();

        let mut tx = self.pool.begin().await?;

        let mut lock_set = vec![cmd.from_account_id, liq_source, liq_target, cmd.to_account_id];
        lock_set.sort();
        lock_set.dedup();
        for id in lock_set {
            store::lock_account(&mut *tx, id)
                .await?
                .ok_or(LedgerError::AccountNotFound(id))?;
        }

        let (from_balance, from_account_currency) =
            store::get_account_balance_and_currency(&mut *tx, cmd.from_account_id)
                .await?
                .ok_or(LedgerError::AccountNotFound(cmd.from_account_id))?;
        let to_account_currency = store::get_account_currency(&mut *tx, cmd.to_account_id)
            .await?
            .ok_or(LedgerError::AccountNotFound(cmd.to_account_id))?;

        if from_account_currency != cmd.from_currency {
            return Err(LedgerError::CurrencyMismatch {
                expected: cmd.from_currency.as_str().into(),
                actual: from_account_currency.as_str().into(),
            });
        }
        if to_account_currency != cmd.to_currency {
            return Err(LedgerError::CurrencyMismatch {
                expected: cmd.to_currency.as_str().into(),
                actual: to_account_currency.as_str().into(),
            });
        }
        if from_balance < cmd.amount_micros {
            return Err(LedgerError::InsufficientFunds);
        }

        let source = Money::new(cmd.amount_micros, cmd.from_currency);
        let target = source.convert(cmd.to_currency, rate)?;
        let amount_source = source.amount_micros;
        let amount_target = target.amount_micros;

        store::create_transaction(
            &mut *tx,
            &store::NewTransaction {
                id: transaction_id,
                amount_micros: amount_source,
                currency: cmd.from_currency,
                tx_type: TxType::Exchange,
                status: TxStatus::Pending,
                reference_id: &cmd.reference_id,
                metadata: serde_json::json!({}),
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
            None,
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

        let metadata = serde_json::json!({
            "from_currency": cmd.from_currency.as_str(),
            "to_currency": cmd.to_currency.as_str(),
            "target_amount": amount_target,
        });
        let rows = store::update_transaction_fx(&mut *tx, transaction_id, rate, &metadata).await?;
        store::require_exactly_one(rows, "update transaction fx metadata")?;

        // Four legs: user -> liq(source) in source currency,
        // liq(target) -> user in target currency.
        store::create_entry(
            &mut *tx,
            Uuid::new_v4(),
            transaction_id,
            cmd.from_account_id,
            amount_source,
            Direction::Debit,
        )
        .await?;
        store::create_entry(
            &mut *tx,
            Uuid::new_v4(),
            transaction_id,
            liq_source,
            amount_source,
            Direction::Credit,
        )
        .await?;
        store::create_entry(
            &mut *tx,
            Uuid::new_v4(),
            transaction_id,
            liq_target,
            amount_target,
            Direction::Debit,
        )
        .await?;
        store::create_entry(
            &mut *tx,
            Uuid::new_v4(),
            transaction_id,
            cmd.to_account_id,
            amount_target,
            Direction::Credit,
        )
        .await?;

        let rows = store::adjust_balance(&mut *tx, cmd.from_account_id, -amount_source).await?;
        store::require_exactly_one(rows, "debit source account")?;
        let rows = store::adjust_balance(&mut *tx, liq_source, amount_source).await?;
        store::require_exactly_one(rows, "credit source liquidity account")?;
        let rows = store::adjust_balance(&mut *tx, liq_target, -amount_target).await?;
        store::require_exactly_one(rows, "debit target liquidity account")?;
        let rows = store::adjust_balance(&mut *tx, cmd.to_account_id, amount_target).await?;
        store::require_exactly_one(rows, "credit destination account")?;

        state::transition(
            &mut *tx,
            transaction_id,
            TxStatus::Completed,
            None,
            "completed",
            None,
        )
        .await?;

        let created = store::get_transaction(&mut *tx, transaction_id)
            .await?
            .ok_or(LedgerError::TransactionNotFound(transaction_id))?;
        tx.commit().await?;
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_order_is_ascending() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        assert!(first < second);
        let (first, second) = if b < a { (b, a) } else { (a, b) };
        assert!(first < second);
    }

    #[test]
    fn test_exchange_lock_set_dedupes_and_sorts() {
        let user = Uuid::from_u128(9);
        let liq_usd = Currency::Usd.system_account_id();
        let liq_eur = Currency::Eur.system_account_id();

        let mut lock_set = vec![user, liq_usd, liq_eur, user];
        lock_set.sort();
        lock_set.dedup();

        assert_eq!(lock_set.len(), 3);
        assert!(lock_set.windows(2).all(|w| w[0] < w[1]));
    }
}
