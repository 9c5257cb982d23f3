//! Core Domain Types
//!
//! Currency, transaction and payout vocabularies, plus the well-known
//! system account identifiers seeded by migration 0003.

pub mod money;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// System user that owns the per-currency liquidity accounts.
pub const SYSTEM_USER_ID: Uuid = Uuid::from_u128(0x11111111_1111_1111_1111_111111111111);

const SYSTEM_ACCOUNT_USD: Uuid = Uuid::from_u128(0x22222222_2222_2222_2222_222222222222);
const SYSTEM_ACCOUNT_EUR: Uuid = Uuid::from_u128(0x33333333_3333_3333_3333_333333333333);
const SYSTEM_ACCOUNT_GBP: Uuid = Uuid::from_u128(0x44444444_4444_4444_4444_444444444444);

/// Supported settlement currencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Currency {
    #[serde(rename = "USD")]
    Usd,
    #[serde(rename = "EUR")]
    Eur,
    #[serde(rename = "GBP")]
    Gbp,
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
            Currency::Gbp => "GBP",
        }
    }

    /// Parse a currency code, tolerating surrounding whitespace and case.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "USD" => Some(Currency::Usd),
            "EUR" => Some(Currency::Eur),
            "GBP" => Some(Currency::Gbp),
            _ => None,
        }
    }

    /// Liquidity account absorbing FX legs and external flows for this currency.
    pub fn system_account_id(&self) -> Uuid {
        match self {
            Currency::Usd => SYSTEM_ACCOUNT_USD,
            Currency::Eur => SYSTEM_ACCOUNT_EUR,
            Currency::Gbp => SYSTEM_ACCOUNT_GBP,
        }
    }

    /// True for the three well-known liquidity accounts, which may hold
    /// negative balances (open FX positions).
    pub fn is_system_account(id: Uuid) -> bool {
        id == SYSTEM_ACCOUNT_USD || id == SYSTEM_ACCOUNT_EUR || id == SYSTEM_ACCOUNT_GBP
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Currency {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Currency::parse(s).ok_or(())
    }
}

/// Transaction kinds recorded on the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxType {
    #[serde(rename = "transfer")]
    Transfer,
    #[serde(rename = "exchange")]
    Exchange,
    #[serde(rename = "payout")]
    Payout,
    #[serde(rename = "deposit")]
    Deposit,
}

impl TxType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxType::Transfer => "transfer",
            TxType::Exchange => "exchange",
            TxType::Payout => "payout",
            TxType::Deposit => "deposit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transfer" => Some(TxType::Transfer),
            "exchange" => Some(TxType::Exchange),
            "payout" => Some(TxType::Payout),
            "deposit" => Some(TxType::Deposit),
            _ => None,
        }
    }
}

impl fmt::Display for TxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Ledger entry direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "debit")]
    Debit,
    #[serde(rename = "credit")]
    Credit,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Debit => "debit",
            Direction::Credit => "credit",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Transaction lifecycle states.
///
/// Legal transitions are enforced by `ledger::state::transition`; nothing
/// else writes `transactions.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "PROCESSING")]
    Processing,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "REVERSED")]
    Reversed,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Pending => "PENDING",
            TxStatus::Processing => "PROCESSING",
            TxStatus::Completed => "COMPLETED",
            TxStatus::Failed => "FAILED",
            TxStatus::Reversed => "REVERSED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "PENDING" => Some(TxStatus::Pending),
            "PROCESSING" => Some(TxStatus::Processing),
            "COMPLETED" => Some(TxStatus::Completed),
            "FAILED" => Some(TxStatus::Failed),
            "REVERSED" => Some(TxStatus::Reversed),
            _ => None,
        }
    }

    /// Terminal states admit no further transitions except reversal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxStatus::Reversed)
    }

    pub const ALL: [TxStatus; 5] = [
        TxStatus::Pending,
        TxStatus::Processing,
        TxStatus::Completed,
        TxStatus::Failed,
        TxStatus::Reversed,
    ];
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payout lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayoutStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "PROCESSING")]
    Processing,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "MANUAL_REVIEW")]
    ManualReview,
}

impl PayoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutStatus::Pending => "PENDING",
            PayoutStatus::Processing => "PROCESSING",
            PayoutStatus::Completed => "COMPLETED",
            PayoutStatus::Failed => "FAILED",
            PayoutStatus::ManualReview => "MANUAL_REVIEW",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(PayoutStatus::Pending),
            "PROCESSING" => Some(PayoutStatus::Processing),
            "COMPLETED" => Some(PayoutStatus::Completed),
            "FAILED" => Some(PayoutStatus::Failed),
            "MANUAL_REVIEW" => Some(PayoutStatus::ManualReview),
            _ => None,
        }
    }
}

impl fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
