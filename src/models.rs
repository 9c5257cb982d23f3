//! Persistent Entity Models
//!
//! Row-shaped structs for the migration tables. Status and currency columns
//! are TEXT in Postgres; the store layer converts them to the typed
//! vocabularies in [`crate::domain`] when mapping rows.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::domain::{Currency, Direction, PayoutStatus, TxStatus, TxType};

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub role: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Account {
    pub id: Uuid,
    pub user_id: Uuid,
    pub currency: Currency,
    pub balance_micros: i64,
    pub locked_micros: i64,
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Spendable portion of the balance: total minus payout locks.
    pub fn available_micros(&self) -> i64 {
        self.balance_micros - self.locked_micros
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Transaction {
    pub id: Uuid,
    pub amount_micros: i64,
    pub currency: Currency,
    #[serde(rename = "type")]
    pub tx_type: TxType,
    pub status: TxStatus,
    pub reference_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fx_rate: Option<Decimal>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// One leg of a double-entry ledger line. Append-only.
#[derive(Debug, Clone, Serialize)]
pub struct Entry {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub account_id: Uuid,
    pub amount_micros: i64,
    pub direction: Direction,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Payout {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub account_id: Uuid,
    pub amount_micros: i64,
    pub currency: Currency,
    pub status: PayoutStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditLog {
    pub id: i64,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub actor_id: Option<Uuid>,
    pub action: String,
    pub prev_state: Option<String>,
    pub next_state: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_available_micros() {
        let account = Account {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            currency: Currency::Usd,
            balance_micros: 1_000_000,
            locked_micros: 250_000,
            created_at: Utc::now(),
        };
        assert_eq!(account.available_micros(), 750_000);
    }
}
