//! Transaction State Machine
//!
//! The single authority over `transactions.status`. Every change goes
//! through [`transition`], which takes the row lock, checks legality,
//! applies the update with an exactly-one assertion, and appends the audit
//! record inside the caller's database transaction. An illegal transition
//! fails the call, which rolls the surrounding transaction back.

use sqlx::PgConnection;
use uuid::Uuid;

use super::audit;
use super::error::LedgerError;
use crate::domain::TxStatus;
use crate::store;

/// Legal transitions. REVERSED is reachable from COMPLETED and FAILED but
/// no endpoint triggers a reversal yet; the machine still admits it.
pub fn can_transition(current: TxStatus, next: TxStatus) -> bool {
    use TxStatus::*;
    matches!(
        (current, next),
        (Pending, Processing)
            | (Pending, Failed)
            | (Processing, Pending) // requeue
            | (Processing, Completed)
            | (Processing, Failed)
            | (Processing, Reversed)
            | (Completed, Reversed)
            | (Failed, Processing)
            | (Failed, Reversed)
    )
}

/// Advance a transaction to `next`, emitting the audit record.
///
/// Idempotent: transitioning to the current status is a no-op. Must be
/// called inside an open database transaction.
pub async fn transition(
    conn: &mut PgConnection,
    transaction_id: Uuid,
    next: TxStatus,
    actor_id: Option<Uuid>,
    action: &str,
    metadata: Option<&serde_json::Value>,
) -> Result<(), LedgerError> {
    let current = store::get_transaction_status_for_update(conn, transaction_id)
        .await?
        .ok_or(LedgerError::TransactionNotFound(transaction_id))?;

    if current == next {
        return Ok(());
    }
    if !can_transition(current, next) {
        return Err(LedgerError::InvalidTransition {
            from: current,
            to: next,
        });
    }

    let rows = store::update_transaction_status(conn, transaction_id, next).await?;
    store::require_exactly_one(rows, "update transaction state")?;

    audit::write(
        conn,
        "transaction",
        transaction_id,
        actor_id,
        action,
        Some(current.as_str()),
        Some(next.as_str()),
        metadata,
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use TxStatus::*;

    #[test]
    fn test_legal_transitions() {
        assert!(can_transition(Pending, Processing));
        assert!(can_transition(Pending, Failed));
        assert!(can_transition(Processing, Pending));
        assert!(can_transition(Processing, Completed));
        assert!(can_transition(Processing, Failed));
        assert!(can_transition(Processing, Reversed));
        assert!(can_transition(Completed, Reversed));
        assert!(can_transition(Failed, Processing));
        assert!(can_transition(Failed, Reversed));
    }

    #[test]
    fn test_illegal_transitions_exhaustive() {
        let legal = [
            (Pending, Processing),
            (Pending, Failed),
            (Processing, Pending),
            (Processing, Completed),
            (Processing, Failed),
            (Processing, Reversed),
            (Completed, Reversed),
            (Failed, Processing),
            (Failed, Reversed),
        ];

        for from in TxStatus::ALL {
            for to in TxStatus::ALL {
                let expected = legal.contains(&(from, to));
                assert_eq!(
                    can_transition(from, to),
                    expected,
                    "{} -> {} should be {}",
                    from,
                    to,
                    if expected { "legal" } else { "illegal" },
                );
            }
        }
    }

    #[test]
    fn test_reversed_is_terminal() {
        for to in TxStatus::ALL {
            assert!(!can_transition(Reversed, to));
        }
    }
}
