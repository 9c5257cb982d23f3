//! Typed Query Layer
//!
//! Every query takes `&mut PgConnection`, so the same function works on a
//! pool connection and inside a `sqlx` transaction (`&mut *tx`).
//! Transaction scoping is the caller's: `pool.begin()` .. `tx.commit()`;
//! dropping an uncommitted transaction rolls it back.
//!
//! Row-affecting statements return the affected-row count and callers
//! assert exactly-one via [`require_exactly_one`]; a mismatch aborts the
//! enclosing transaction.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use crate::domain::{Currency, Direction, PayoutStatus, TxStatus, TxType};
use crate::models::{Account, AuditLog, Entry, Payout, Transaction, User};

/// Assert that a statement touched exactly one row.
///
/// Anything else is a programmer error (lost update, wrong predicate) and
/// must surface, never be ignored.
pub fn require_exactly_one(rows: u64, operation: &str) -> Result<(), sqlx::Error> {
    if rows != 1 {
        return Err(sqlx::Error::Protocol(format!(
            "{} affected {} rows",
            operation, rows
        )));
    }
    Ok(())
}

/// True when the error is a Postgres unique-constraint violation (23505).
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn decode_err(msg: String) -> sqlx::Error {
    sqlx::Error::Decode(msg.into())
}

fn parse_currency(raw: &str) -> Result<Currency, sqlx::Error> {
    Currency::parse(raw).ok_or_else(|| decode_err(format!("unknown currency {:?}", raw)))
}

fn parse_tx_status(raw: &str) -> Result<TxStatus, sqlx::Error> {
    TxStatus::parse(raw).ok_or_else(|| decode_err(format!("unknown transaction status {:?}", raw)))
}

fn parse_payout_status(raw: &str) -> Result<PayoutStatus, sqlx::Error> {
    PayoutStatus::parse(raw).ok_or_else(|| decode_err(format!("unknown payout status {:?}", raw)))
}

fn parse_direction(raw: &str) -> Result<Direction, sqlx::Error> {
    match raw {
        "debit" => Ok(Direction::Debit),
        "credit" => Ok(Direction::Credit),
        other => Err(decode_err(format!("unknown entry direction {:?}", other))),
    }
}

// === Users & accounts ===

pub async fn create_user(
    conn: &mut PgConnection,
    id: Uuid,
    username: &str,
    email: &str,
    role: &str,
) -> Result<DateTime<Utc>, sqlx::Error> {
    sqlx::query_scalar::<_, DateTime<Utc>>(
        r#"
        INSERT INTO users (id, username, email, role)
        VALUES ($1, $2, $3, $4)
        RETURNING created_at
        "#,
    )
    .bind(id)
    .bind(username)
    .bind(email)
    .bind(role)
    .fetch_one(conn)
    .await
}

pub async fn get_user(conn: &mut PgConnection, id: Uuid) -> Result<Option<User>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT id, username, email, role, created_at FROM users WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(conn)
    .await?;

    Ok(row.map(|row| User {
        id: row.get("id"),
        username: row.get("username"),
        email: row.get("email"),
        role: row.get("role"),
        created_at: row.get("created_at"),
    }))
}

pub async fn create_account(
    conn: &mut PgConnection,
    id: Uuid,
    user_id: Uuid,
    currency: Currency,
    balance_micros: i64,
) -> Result<DateTime<Utc>, sqlx::Error> {
    sqlx::query_scalar::<_, DateTime<Utc>>(
        r#"
        INSERT INTO accounts (id, user_id, currency, balance_micros)
        VALUES ($1, $2, $3, $4)
        RETURNING created_at
        "#,
    )
    .bind(id)
    .bind(user_id)
    .bind(currency.as_str())
    .bind(balance_micros)
    .fetch_one(conn)
    .await
}

fn row_to_account(row: &sqlx::postgres::PgRow) -> Result<Account, sqlx::Error> {
    Ok(Account {
        id: row.get("id"),
        user_id: row.get("user_id"),
        currency: parse_currency(row.get("currency"))?,
        balance_micros: row.get("balance_micros"),
        locked_micros: row.get("locked_micros"),
        created_at: row.get("created_at"),
    })
}

pub async fn get_account(
    conn: &mut PgConnection,
    id: Uuid,
) -> Result<Option<Account>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT id, user_id, currency, balance_micros, locked_micros, created_at
        FROM accounts
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(conn)
    .await?;

    row.map(|r| row_to_account(&r)).transpose()
}

/// Take the exclusive row lock on an account. Returns None when the
/// account does not exist.
pub async fn lock_account(
    conn: &mut PgConnection,
    id: Uuid,
) -> Result<Option<Uuid>, sqlx::Error> {
    sqlx::query_scalar::<_, Uuid>("SELECT id FROM accounts WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(conn)
        .await
}

/// Lock the account row and return it with balance and locked funds.
pub async fn get_account_for_update(
    conn: &mut PgConnection,
    id: Uuid,
) -> Result<Option<Account>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT id, user_id, currency, balance_micros, locked_micros, created_at
        FROM accounts
        WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(id)
    .fetch_optional(conn)
    .await?;

    row.map(|r| row_to_account(&r)).transpose()
}

pub async fn get_account_balance_and_currency(
    conn: &mut PgConnection,
    id: Uuid,
) -> Result<Option<(i64, Currency)>, sqlx::Error> {
    let row = sqlx::query("SELECT balance_micros, currency FROM accounts WHERE id = $1")
        .bind(id)
        .fetch_optional(conn)
        .await?;

    row.map(|r| Ok((r.get("balance_micros"), parse_currency(r.get("currency"))?)))
        .transpose()
}

pub async fn get_account_currency(
    conn: &mut PgConnection,
    id: Uuid,
) -> Result<Option<Currency>, sqlx::Error> {
    let raw = sqlx::query_scalar::<_, String>("SELECT currency FROM accounts WHERE id = $1")
        .bind(id)
        .fetch_optional(conn)
        .await?;

    raw.map(|r| parse_currency(&r)).transpose()
}

/// Apply a signed delta to an account balance.
pub async fn adjust_balance(
    conn: &mut PgConnection,
    id: Uuid,
    delta_micros: i64,
) -> Result<u64, sqlx::Error> {
    let result =
        sqlx::query("UPDATE accounts SET balance_micros = balance_micros + $1 WHERE id = $2")
            .bind(delta_micros)
            .bind(id)
            .execute(conn)
            .await?;
    Ok(result.rows_affected())
}

/// Reserve funds for a payout.
pub async fn lock_funds(
    conn: &mut PgConnection,
    id: Uuid,
    amount_micros: i64,
) -> Result<u64, sqlx::Error> {
    let result =
        sqlx::query("UPDATE accounts SET locked_micros = locked_micros + $1 WHERE id = $2")
            .bind(amount_micros)
            .bind(id)
            .execute(conn)
            .await?;
    Ok(result.rows_affected())
}

/// Consume a payout reservation: both the lock and the balance drop.
pub async fn deduct_locked_funds(
    conn: &mut PgConnection,
    id: Uuid,
    amount_micros: i64,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE accounts
        SET locked_micros = locked_micros - $1,
            balance_micros = balance_micros - $1
        WHERE id = $2
        "#,
    )
    .bind(amount_micros)
    .bind(id)
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

/// Release a payout reservation without touching the balance.
pub async fn release_locked_funds(
    conn: &mut PgConnection,
    id: Uuid,
    amount_micros: i64,
) -> Result<u64, sqlx::Error> {
    let result =
        sqlx::query("UPDATE accounts SET locked_micros = locked_micros - $1 WHERE id = $2")
            .bind(amount_micros)
            .bind(id)
            .execute(conn)
            .await?;
    Ok(result.rows_affected())
}

/// Release that tolerates an already-released lock: only applies when the
/// full amount is still locked, so locked_micros can never go negative.
pub async fn release_locked_funds_safe(
    conn: &mut PgConnection,
    id: Uuid,
    amount_micros: i64,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE accounts
        SET locked_micros = locked_micros - $1
        WHERE id = $2 AND locked_micros >= $1
        "#,
    )
    .bind(amount_micros)
    .bind(id)
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

// === Transactions ===

pub struct NewTransaction<'a> {
    pub id: Uuid,
    pub amount_micros: i64,
    pub currency: Currency,
    pub tx_type: TxType,
    pub status: TxStatus,
    pub reference_id: &'a str,
    pub metadata: serde_json::Value,
}

pub async fn create_transaction(
    conn: &mut PgConnection,
    tx: &NewTransaction<'_>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO transactions (id, amount_micros, currency, type, status, reference_id, metadata)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(tx.id)
    .bind(tx.amount_micros)
    .bind(tx.currency.as_str())
    .bind(tx.tx_type.as_str())
    .bind(tx.status.as_str())
    .bind(tx.reference_id)
    .bind(&tx.metadata)
    .execute(conn)
    .await?;
    Ok(())
}

fn row_to_transaction(row: &sqlx::postgres::PgRow) -> Result<Transaction, sqlx::Error> {
    let tx_type: String = row.get("type");
    Ok(Transaction {
        id: row.get("id"),
        amount_micros: row.get("amount_micros"),
        currency: parse_currency(row.get("currency"))?,
        tx_type: TxType::parse(&tx_type)
            .ok_or_else(|| decode_err(format!("unknown transaction type {:?}", tx_type)))?,
        status: parse_tx_status(row.get("status"))?,
        reference_id: row.get("reference_id"),
        fx_rate: row.get::<Option<Decimal>, _>("fx_rate"),
        metadata: row.get("metadata"),
        created_at: row.get("created_at"),
    })
}

const TRANSACTION_COLUMNS: &str =
    "id, amount_micros, currency, type, status, reference_id, fx_rate, metadata, created_at";

pub async fn get_transaction(
    conn: &mut PgConnection,
    id: Uuid,
) -> Result<Option<Transaction>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM transactions WHERE id = $1",
        TRANSACTION_COLUMNS
    ))
    .bind(id)
    .fetch_optional(conn)
    .await?;

    row.map(|r| row_to_transaction(&r)).transpose()
}

/// Ledger-layer idempotency lookup.
pub async fn get_transaction_by_reference(
    conn: &mut PgConnection,
    reference_id: &str,
) -> Result<Option<Transaction>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM transactions WHERE reference_id = $1",
        TRANSACTION_COLUMNS
    ))
    .bind(reference_id)
    .fetch_optional(conn)
    .await?;

    row.map(|r| row_to_transaction(&r)).transpose()
}

/// Row-lock the transaction and read its current status.
pub async fn get_transaction_status_for_update(
    conn: &mut PgConnection,
    id: Uuid,
) -> Result<Option<TxStatus>, sqlx::Error> {
    let raw =
        sqlx::query_scalar::<_, String>("SELECT status FROM transactions WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(conn)
            .await?;

    raw.map(|r| parse_tx_status(&r)).transpose()
}

pub async fn update_transaction_status(
    conn: &mut PgConnection,
    id: Uuid,
    status: TxStatus,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("UPDATE transactions SET status = $1 WHERE id = $2")
        .bind(status.as_str())
        .bind(id)
        .execute(conn)
        .await?;
    Ok(result.rows_affected())
}

pub async fn update_transaction_fx(
    conn: &mut PgConnection,
    id: Uuid,
    fx_rate: Decimal,
    metadata: &serde_json::Value,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("UPDATE transactions SET fx_rate = $1, metadata = $2 WHERE id = $3")
        .bind(fx_rate)
        .bind(metadata)
        .bind(id)
        .execute(conn)
        .await?;
    Ok(result.rows_affected())
}

// === Ledger entries ===

pub async fn create_entry(
    conn: &mut PgConnection,
    id: Uuid,
    transaction_id: Uuid,
    account_id: Uuid,
    amount_micros: i64,
    direction: Direction,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO entries (id, transaction_id, account_id, amount_micros, direction)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(id)
    .bind(transaction_id)
    .bind(account_id)
    .bind(amount_micros)
    .bind(direction.as_str())
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn entries_for_transaction(
    conn: &mut PgConnection,
    transaction_id: Uuid,
) -> Result<Vec<Entry>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT id, transaction_id, account_id, amount_micros, direction, created_at
        FROM entries
        WHERE transaction_id = $1
        ORDER BY created_at, id
        "#,
    )
    .bind(transaction_id)
    .fetch_all(conn)
    .await?;

    rows.iter()
        .map(|row| {
            Ok(Entry {
                id: row.get("id"),
                transaction_id: row.get("transaction_id"),
                account_id: row.get("account_id"),
                amount_micros: row.get("amount_micros"),
                direction: parse_direction(row.get("direction"))?,
                created_at: row.get("created_at"),
            })
        })
        .collect()
}

/// Net sum of all entries: credits minus debits. Zero on a balanced ledger.
pub async fn ledger_net(conn: &mut PgConnection) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        r#"
        SELECT COALESCE(SUM(
            CASE direction WHEN 'credit' THEN amount_micros ELSE -amount_micros END
        ), 0)::BIGINT
        FROM entries
        "#,
    )
    .fetch_one(conn)
    .await
}

/// Per-currency nets that are out of balance, via the account join.
pub async fn ledger_currency_imbalances(
    conn: &mut PgConnection,
) -> Result<Vec<(String, i64)>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT a.currency AS currency,
               SUM(CASE e.direction WHEN 'credit' THEN e.amount_micros ELSE -e.amount_micros END)::BIGINT AS net_micros
        FROM entries e
        JOIN accounts a ON a.id = e.account_id
        GROUP BY a.currency
        HAVING SUM(CASE e.direction WHEN 'credit' THEN e.amount_micros ELSE -e.amount_micros END) <> 0
        "#,
    )
    .fetch_all(conn)
    .await?;

    Ok(rows
        .iter()
        .map(|row| (row.get("currency"), row.get("net_micros")))
        .collect())
}

// === Payouts ===

fn row_to_payout(row: &sqlx::postgres::PgRow) -> Result<Payout, sqlx::Error> {
    Ok(Payout {
        id: row.get("id"),
        transaction_id: row.get("transaction_id"),
        account_id: row.get("account_id"),
        amount_micros: row.get("amount_micros"),
        currency: parse_currency(row.get("currency"))?,
        status: parse_payout_status(row.get("status"))?,
        gateway_ref: row.get("gateway_ref"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

const PAYOUT_COLUMNS: &str =
    "id, transaction_id, account_id, amount_micros, currency, status, gateway_ref, created_at, updated_at";

pub async fn insert_payout(
    conn: &mut PgConnection,
    id: Uuid,
    transaction_id: Uuid,
    account_id: Uuid,
    amount_micros: i64,
    currency: Currency,
    status: PayoutStatus,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO payouts (id, transaction_id, account_id, amount_micros, currency, status)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(id)
    .bind(transaction_id)
    .bind(account_id)
    .bind(amount_micros)
    .bind(currency.as_str())
    .bind(status.as_str())
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn get_payout(
    conn: &mut PgConnection,
    id: Uuid,
) -> Result<Option<Payout>, sqlx::Error> {
    let row = sqlx::query(&format!("SELECT {} FROM payouts WHERE id = $1", PAYOUT_COLUMNS))
        .bind(id)
        .fetch_optional(conn)
        .await?;
    row.map(|r| row_to_payout(&r)).transpose()
}

pub async fn get_payout_for_update(
    conn: &mut PgConnection,
    id: Uuid,
) -> Result<Option<Payout>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM payouts WHERE id = $1 FOR UPDATE",
        PAYOUT_COLUMNS
    ))
    .bind(id)
    .fetch_optional(conn)
    .await?;
    row.map(|r| row_to_payout(&r)).transpose()
}

pub async fn get_payout_by_transaction(
    conn: &mut PgConnection,
    transaction_id: Uuid,
) -> Result<Option<Payout>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM payouts WHERE transaction_id = $1",
        PAYOUT_COLUMNS
    ))
    .bind(transaction_id)
    .fetch_optional(conn)
    .await?;
    row.map(|r| row_to_payout(&r)).transpose()
}

pub async fn update_payout_status(
    conn: &mut PgConnection,
    id: Uuid,
    status: PayoutStatus,
    gateway_ref: Option<&str>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE payouts SET status = $1, gateway_ref = $2, updated_at = now() WHERE id = $3",
    )
    .bind(status.as_str())
    .bind(gateway_ref)
    .bind(id)
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

/// Claim PENDING payouts oldest-first. SKIP LOCKED keeps concurrent worker
/// instances from ever claiming the same row.
pub async fn claim_pending_payouts(
    conn: &mut PgConnection,
    limit: i64,
) -> Result<Vec<Payout>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {}
        FROM payouts
        WHERE status = 'PENDING'
        ORDER BY created_at ASC
        LIMIT $1
        FOR UPDATE SKIP LOCKED
        "#,
        PAYOUT_COLUMNS
    ))
    .bind(limit)
    .fetch_all(conn)
    .await?;

    rows.iter().map(row_to_payout).collect()
}

/// PROCESSING payouts whose claim went stale (worker crashed mid-dispatch).
pub async fn stale_processing_payouts(
    conn: &mut PgConnection,
    cutoff: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<Payout>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {}
        FROM payouts
        WHERE status = 'PROCESSING' AND updated_at < $1
        ORDER BY updated_at ASC
        LIMIT $2
        FOR UPDATE SKIP LOCKED
        "#,
        PAYOUT_COLUMNS
    ))
    .bind(cutoff)
    .bind(limit)
    .fetch_all(conn)
    .await?;

    rows.iter().map(row_to_payout).collect()
}

pub async fn payouts_by_status(
    conn: &mut PgConnection,
    status: PayoutStatus,
    limit: i64,
    offset: i64,
) -> Result<Vec<Payout>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {}
        FROM payouts
        WHERE status = $1
        ORDER BY created_at ASC
        LIMIT $2 OFFSET $3
        "#,
        PAYOUT_COLUMNS
    ))
    .bind(status.as_str())
    .bind(limit)
    .bind(offset)
    .fetch_all(conn)
    .await?;

    rows.iter().map(row_to_payout).collect()
}

pub async fn count_payouts_by_status(
    conn: &mut PgConnection,
    status: PayoutStatus,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM payouts WHERE status = $1")
        .bind(status.as_str())
        .fetch_one(conn)
        .await
}

// === Audit log ===

#[allow(clippy::too_many_arguments)]
pub async fn insert_audit_log(
    conn: &mut PgConnection,
    entity_type: &str,
    entity_id: Uuid,
    actor_id: Option<Uuid>,
    action: &str,
    prev_state: Option<&str>,
    next_state: Option<&str>,
    metadata: Option<&serde_json::Value>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO audit_logs (entity_type, entity_id, actor_id, action, prev_state, next_state, metadata)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(entity_type)
    .bind(entity_id)
    .bind(actor_id)
    .bind(action)
    .bind(prev_state)
    .bind(next_state)
    .bind(metadata)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn audit_logs_by_entity(
    conn: &mut PgConnection,
    entity_type: &str,
    entity_id: Uuid,
) -> Result<Vec<AuditLog>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT id, entity_type, entity_id, actor_id, action, prev_state, next_state, metadata, created_at
        FROM audit_logs
        WHERE entity_type = $1 AND entity_id = $2
        ORDER BY id ASC
        "#,
    )
    .bind(entity_type)
    .bind(entity_id)
    .fetch_all(conn)
    .await?;

    Ok(rows
        .iter()
        .map(|row| AuditLog {
            id: row.get("id"),
            entity_type: row.get("entity_type"),
            entity_id: row.get("entity_id"),
            actor_id: row.get("actor_id"),
            action: row.get("action"),
            prev_state: row.get("prev_state"),
            next_state: row.get("next_state"),
            metadata: row.get("metadata"),
            created_at: row.get("created_at"),
        })
        .collect())
}

// === Idempotency keys ===

#[derive(Debug, Clone)]
pub struct IdempotencyRow {
    pub key: String,
    pub request_hash: String,
    pub response_status: Option<i32>,
    pub response_body: Option<Vec<u8>>,
    pub content_type: Option<String>,
    pub in_progress: bool,
}

fn row_to_idempotency(row: &sqlx::postgres::PgRow) -> IdempotencyRow {
    IdempotencyRow {
        key: row.get("idempotency_key"),
        request_hash: row.get("request_hash"),
        response_status: row.get("response_status"),
        response_body: row.get("response_body"),
        content_type: row.get("content_type"),
        in_progress: row.get("in_progress"),
    }
}

/// Reserve a key for execution. Returns false when a concurrent request
/// already holds the reservation.
pub async fn reserve_idempotency_key(
    conn: &mut PgConnection,
    key: &str,
    request_hash: &str,
    method: &str,
    path: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO idempotency_keys (idempotency_key, request_hash, method, path, in_progress)
        VALUES ($1, $2, $3, $4, TRUE)
        ON CONFLICT (idempotency_key) DO NOTHING
        "#,
    )
    .bind(key)
    .bind(request_hash)
    .bind(method)
    .bind(path)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn get_idempotency_key(
    conn: &mut PgConnection,
    key: &str,
) -> Result<Option<IdempotencyRow>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT idempotency_key, request_hash, response_status, response_body, content_type, in_progress
        FROM idempotency_keys
        WHERE idempotency_key = $1
        "#,
    )
    .bind(key)
    .fetch_optional(conn)
    .await?;
    Ok(row.map(|r| row_to_idempotency(&r)))
}

pub async fn finalize_idempotency_key(
    conn: &mut PgConnection,
    key: &str,
    request_hash: &str,
    status: i32,
    body: &[u8],
    content_type: &str,
) -> Result<Option<IdempotencyRow>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        UPDATE idempotency_keys
        SET response_status = $1,
            response_body = $2,
            content_type = $3,
            in_progress = FALSE,
            updated_at = now()
        WHERE idempotency_key = $4 AND request_hash = $5
        RETURNING idempotency_key, request_hash, response_status, response_body, content_type, in_progress
        "#,
    )
    .bind(status)
    .bind(body)
    .bind(content_type)
    .bind(key)
    .bind(request_hash)
    .fetch_optional(conn)
    .await?;
    Ok(row.map(|r| row_to_idempotency(&r)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_exactly_one() {
        assert!(require_exactly_one(1, "update account").is_ok());
        assert!(require_exactly_one(0, "update account").is_err());
        assert!(require_exactly_one(2, "update account").is_err());
    }

    #[test]
    fn test_require_exactly_one_message_names_operation() {
        let err = require_exactly_one(0, "debit sender account").unwrap_err();
        assert!(err.to_string().contains("debit sender account"));
    }
}
