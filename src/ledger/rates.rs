//! Exchange Rate Source
//!
//! Pluggable FX rate service. The mock serves a static table; live rate
//! sourcing is out of scope.

use async_trait::async_trait;
use rust_decimal::Decimal;

use super::error::LedgerError;
use crate::domain::Currency;

/// Source of FX conversion rates, expressed as target units per source unit.
#[async_trait]
pub trait ExchangeRateService: Send + Sync {
    async fn get_exchange_rate(
        &self,
        source: Currency,
        target: Currency,
    ) -> Result<Decimal, LedgerError>;
}

/// Static rate table for tests and local runs.
///
/// USD -> EUR: 0.92, USD -> GBP: 0.79; cross rates derive through USD.
pub struct MockExchangeRateService;

impl MockExchangeRateService {
    pub fn new() -> Self {
        Self
    }

    fn usd_rate(currency: Currency) -> Decimal {
        match currency {
            Currency::Usd => Decimal::ONE,
            Currency::Eur => Decimal::new(92, 2),
            Currency::Gbp => Decimal::new(79, 2),
        }
    }
}

impl Default for MockExchangeRateService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeRateService for MockExchangeRateService {
    async fn get_exchange_rate(
        &self,
        source: Currency,
        target: Currency,
    ) -> Result<Decimal, LedgerError> {
        if source == target {
            return Ok(Decimal::ONE);
        }
        // Rate = target / source, both relative to USD.
        Ok(Self::usd_rate(target) / Self::usd_rate(source))
    }
}
