//! Ledger Error Types

use thiserror::Error;
use uuid::Uuid;

use crate::domain::money::MoneyError;
use crate::domain::TxStatus;

/// Errors produced by ledger writes: transfers, exchanges, state
/// transitions and the deposit/payout legs built on them.
#[derive(Error, Debug, Clone)]
pub enum LedgerError {
    // === Validation ===
    #[error("amount must be greater than zero")]
    InvalidAmount,

    #[error("reference_id is required")]
    ReferenceRequired,

    #[error("cannot transfer to the same account")]
    SameAccount,

    #[error("source and target currency must be different")]
    SameCurrencyExchange,

    #[error("unsupported currency: {0}")]
    UnsupportedCurrency(String),

    /// An FX product does not fit in 64-bit micros.
    #[error("amount too large, would overflow")]
    AmountOverflow,

    // === Account state ===
    #[error("account not found: {0}")]
    AccountNotFound(Uuid),

    #[error("currency mismatch: expected {expected}, got {actual}")]
    CurrencyMismatch { expected: String, actual: String },

    #[error("insufficient funds")]
    InsufficientFunds,

    /// Unique violation on `reference_id`: a concurrent request with the
    /// same reference committed first. Callers re-read and replay.
    #[error("duplicate reference_id")]
    DuplicateReference,

    // === State machine ===
    #[error("invalid transaction state transition: {from} -> {to}")]
    InvalidTransition { from: TxStatus, to: TxStatus },

    #[error("transaction not found: {0}")]
    TransactionNotFound(Uuid),

    // === External collaborators ===
    #[error("exchange rate unavailable for {from}->{to}")]
    RateUnavailable { from: String, to: String },

    // === Infrastructure ===
    #[error("database error: {0}")]
    Database(String),
}

impl LedgerError {
    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InvalidAmount => "INVALID_AMOUNT",
            LedgerError::ReferenceRequired => "REFERENCE_REQUIRED",
            LedgerError::SameAccount => "SAME_ACCOUNT",
            LedgerError::SameCurrencyExchange => "SAME_CURRENCY_EXCHANGE",
            LedgerError::UnsupportedCurrency(_) => "UNSUPPORTED_CURRENCY",
            LedgerError::AmountOverflow => "AMOUNT_OVERFLOW",
            LedgerError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            LedgerError::CurrencyMismatch { .. } => "CURRENCY_MISMATCH",
            LedgerError::InsufficientFunds => "INSUFFICIENT_FUNDS",
            LedgerError::DuplicateReference => "DUPLICATE_REFERENCE",
            LedgerError::InvalidTransition { .. } => "INVALID_TRANSITION",
            LedgerError::TransactionNotFound(_) => "TRANSACTION_NOT_FOUND",
            LedgerError::RateUnavailable { .. } => "RATE_UNAVAILABLE",
            LedgerError::Database(_) => "DATABASE_ERROR",
        }
    }

    /// HTTP status suggestion for the handler boundary.
    pub fn http_status(&self) -> u16 {
        match self {
            LedgerError::InvalidAmount
            | LedgerError::ReferenceRequired
            | LedgerError::SameAccount
            | LedgerError::SameCurrencyExchange
            | LedgerError::UnsupportedCurrency(_)
            | LedgerError::AmountOverflow
            | LedgerError::CurrencyMismatch { .. }
            | LedgerError::InsufficientFunds => 400,
            LedgerError::DuplicateReference => 409,
            LedgerError::AccountNotFound(_) | LedgerError::TransactionNotFound(_) => 404,
            LedgerError::InvalidTransition { .. }
            | LedgerError::RateUnavailable { .. }
            | LedgerError::Database(_) => 500,
        }
    }
}

impl From<MoneyError> for LedgerError {
    fn from(e: MoneyError) -> Self {
        match e {
            MoneyError::Overflow => LedgerError::AmountOverflow,
        }
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        if crate::store::is_unique_violation(&e) {
            return LedgerError::DuplicateReference;
        }
        LedgerError::Database(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(LedgerError::InsufficientFunds.code(), "INSUFFICIENT_FUNDS");
        assert_eq!(LedgerError::SameAccount.code(), "SAME_ACCOUNT");
        assert_eq!(
            LedgerError::InvalidTransition {
                from: TxStatus::Completed,
                to: TxStatus::Pending
            }
            .code(),
            "INVALID_TRANSITION"
        );
    }

    #[test]
    fn test_http_status() {
        assert_eq!(LedgerError::InvalidAmount.http_status(), 400);
        assert_eq!(LedgerError::InsufficientFunds.http_status(), 400);
        assert_eq!(LedgerError::AccountNotFound(Uuid::nil()).http_status(), 404);
        assert_eq!(LedgerError::Database("boom".into()).http_status(), 500);
    }

    #[test]
    fn test_display() {
        assert_eq!(
            LedgerError::InsufficientFunds.to_string(),
            "insufficient funds"
        );
        let err = LedgerError::InvalidTransition {
            from: TxStatus::Completed,
            to: TxStatus::Pending,
        };
        assert_eq!(
            err.to_string(),
            "invalid transaction state transition: COMPLETED -> PENDING"
        );
    }
}
