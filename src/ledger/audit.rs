//! Audit Trail Writer
//!
//! Append-only records of entity state changes. The table rejects UPDATE
//! and DELETE at the database layer.

use sqlx::PgConnection;
use uuid::Uuid;

use super::error::LedgerError;
use crate::store;

/// Append a single audit record inside the caller's transaction.
#[allow(clippy::too_many_arguments)]
pub async fn write(
    conn: &mut PgConnection,
    entity_type: &str,
    entity_id: Uuid,
    actor_id: Option<Uuid>,
    action: &str,
    prev_state: Option<&str>,
    next_state: Option<&str>,
    metadata: Option<&serde_json::Value>,
) -> Result<(), LedgerError> {
    store::insert_audit_log(
        conn,
        entity_type,
        entity_id,
        actor_id,
        action,
        prev_state.filter(|s| !s.is_empty()),
        next_state.filter(|s| !s.is_empty()),
        metadata,
    )
    .await?;
    Ok(())
}

/// Metadata payload carrying a human-readable reason.
pub fn reason_metadata(reason: &str) -> serde_json::Value {
    serde_json::json!({ "reason": reason })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_metadata() {
        let v = reason_metadata("gateway down");
        assert_eq!(v["reason"], "gateway down");
    }
}
