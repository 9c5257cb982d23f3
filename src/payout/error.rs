//! Payout Error Types

use thiserror::Error;
use uuid::Uuid;

use crate::ledger::LedgerError;

#[derive(Error, Debug, Clone)]
pub enum PayoutError {
    #[error("invalid payout request: {0}")]
    Validation(String),

    #[error("payout not found: {0}")]
    NotFound(Uuid),

    #[error("payout is not in manual review")]
    NotInManualReview,

    #[error("invalid manual review decision: {0}")]
    InvalidDecision(String),

    /// A transaction exists for the reference but has no payout row.
    #[error("payout reference is inconsistent: {0}")]
    InconsistentReference(String),

    /// The claimed batch was abandoned because shutdown was requested;
    /// unattempted payouts have been requeued.
    #[error("payout processing cancelled")]
    Cancelled,

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("database error: {0}")]
    Database(String),
}

impl PayoutError {
    pub fn code(&self) -> &'static str {
        match self {
            PayoutError::Validation(_) => "INVALID_REQUEST",
            PayoutError::NotFound(_) => "PAYOUT_NOT_FOUND",
            PayoutError::NotInManualReview => "NOT_IN_MANUAL_REVIEW",
            PayoutError::InvalidDecision(_) => "INVALID_DECISION",
            PayoutError::InconsistentReference(_) => "INCONSISTENT_REFERENCE",
            PayoutError::Cancelled => "CANCELLED",
            PayoutError::Ledger(err) => err.code(),
            PayoutError::Database(_) => "DATABASE_ERROR",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            PayoutError::Validation(_) | PayoutError::InvalidDecision(_) => 400,
            PayoutError::NotFound(_) => 404,
            PayoutError::NotInManualReview => 409,
            PayoutError::InconsistentReference(_)
            | PayoutError::Cancelled
            | PayoutError::Database(_) => 500,
            PayoutError::Ledger(err) => err.http_status(),
        }
    }
}

impl From<sqlx::Error> for PayoutError {
    fn from(e: sqlx::Error) -> Self {
        PayoutError::Database(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status() {
        assert_eq!(PayoutError::Validation("bad iban".into()).http_status(), 400);
        assert_eq!(PayoutError::NotFound(Uuid::nil()).http_status(), 404);
        assert_eq!(PayoutError::NotInManualReview.http_status(), 409);
        assert_eq!(
            PayoutError::Ledger(LedgerError::InsufficientFunds).http_status(),
            400
        );
    }

    #[test]
    fn test_ledger_code_passthrough() {
        let err = PayoutError::Ledger(LedgerError::InsufficientFunds);
        assert_eq!(err.code(), "INSUFFICIENT_FUNDS");
    }
}
