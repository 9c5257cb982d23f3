//! Payout Gateway
//!
//! External payout destination. The trait is the seam for real providers;
//! the mock simulates network latency and intermittent failures for local
//! runs and tests.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;

use crate::domain::Currency;

#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    /// The call was cancelled before an outcome was observed. The payout
    /// outcome is unknown; it must be requeued, never failed.
    #[error("gateway call cancelled")]
    Cancelled,

    #[error("gateway error: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Gateway: Send + Sync {
    /// Send a payout to an external destination. Returns the gateway
    /// reference on success. May block for seconds.
    async fn send_payout(
        &self,
        destination: &str,
        amount_micros: i64,
        currency: Currency,
    ) -> Result<String, GatewayError>;
}

/// Simulated gateway: sleeps 2-5 seconds, fails a configurable fraction of
/// calls, and returns a `MOCK-` reference otherwise.
pub struct MockGateway {
    pub failure_rate: f64,
}

impl MockGateway {
    pub fn new() -> Self {
        Self { failure_rate: 0.1 }
    }

    pub fn with_failure_rate(failure_rate: f64) -> Self {
        Self { failure_rate }
    }
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Gateway for MockGateway {
    async fn send_payout(
        &self,
        destination: &str,
        amount_micros: i64,
        currency: Currency,
    ) -> Result<String, GatewayError> {
        let (delay_ms, fails, suffix) = {
            let mut rng = rand::thread_rng();
            (
                rng.gen_range(2000..5000u64),
                rng.gen_bool(self.failure_rate.clamp(0.0, 1.0)),
                rng.gen_range(0..100_000u32),
            )
        };
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;

        if fails {
            return Err(GatewayError::Unavailable(
                "gateway temporarily unavailable".into(),
            ));
        }

        tracing::debug!(destination, amount_micros, %currency, "mock payout sent");
        Ok(format!("MOCK-{}-{:05}", chrono::Utc::now().format("%Y%m%d-%H%M%S"), suffix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_gateway_always_fails_at_full_rate() {
        let gw = MockGateway::with_failure_rate(1.0);
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            gw.send_payout("DE89370400440532013000 (Jane)", 1_000_000, Currency::Eur),
        )
        .await
        .expect("gateway call timed out");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_mock_gateway_returns_reference() {
        let gw = MockGateway::with_failure_rate(0.0);
        let reference = tokio::time::timeout(
            Duration::from_secs(10),
            gw.send_payout("GB29NWBK60161331926819 (John)", 500_000, Currency::Usd),
        )
        .await
        .expect("gateway call timed out")
        .expect("mock gateway should succeed at zero failure rate");
        assert!(reference.starts_with("MOCK-"));
    }
}
