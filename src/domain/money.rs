//! Money Arithmetic
//!
//! All amounts at rest are signed 64-bit micros (10^-6). FX multiplication
//! goes through `rust_decimal` intermediates and truncates toward zero back
//! to micros. Floating point never touches a currency value, and a product
//! that does not fit in micros is an error, never a silently wrong amount.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use thiserror::Error;

use super::Currency;

const MICROS_SCALE: u32 = 6;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MoneyError {
    #[error("amount too large, would overflow")]
    Overflow,
}

/// A monetary value in a specific currency, denominated in micros.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Money {
    pub amount_micros: i64,
    pub currency: Currency,
}

impl Money {
    pub fn new(amount_micros: i64, currency: Currency) -> Self {
        Self {
            amount_micros,
            currency,
        }
    }

    /// Decimal representation in whole currency units (e.g. 1_500_000 -> 1.5).
    pub fn to_decimal(&self) -> Decimal {
        Decimal::new(self.amount_micros, MICROS_SCALE)
    }

    /// Convert to a target currency at `rate` (target units per source unit).
    ///
    /// The result is truncated toward zero to micros; the ledger never
    /// rounds funds into existence. Fails when the product does not fit in
    /// 64-bit micros.
    pub fn convert(&self, target: Currency, rate: Decimal) -> Result<Money, MoneyError> {
        let units = self
            .to_decimal()
            .checked_mul(rate)
            .ok_or(MoneyError::Overflow)?;
        Ok(Money {
            amount_micros: micros_from_decimal(units)?,
            currency: target,
        })
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.to_decimal(), self.currency)
    }
}

/// Truncate a decimal amount of whole currency units down to micros.
pub fn micros_from_decimal(units: Decimal) -> Result<i64, MoneyError> {
    let micros = units
        .checked_mul(Decimal::from(1_000_000i64))
        .ok_or(MoneyError::Overflow)?;
    micros.trunc().to_i64().ok_or(MoneyError::Overflow)
}
