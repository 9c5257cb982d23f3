//! Ledger Reconciliation
//!
//! Periodic global invariant check: the net of all entries (credits minus
//! debits) must be zero. An imbalance is an observability signal, not a
//! run error; nothing auto-remediates.

use sqlx::PgPool;

use crate::observability;
use crate::store;

pub struct ReconciliationService {
    pool: PgPool,
}

impl ReconciliationService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Check the global ledger sum, drilling into per-currency nets when
    /// it diverges.
    pub async fn run(&self) -> Result<(), sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        let net = store::ledger_net(&mut *conn).await?;

        if net != 0 {
            observability::increment_ledger_imbalance("ALL");
            tracing::error!(net_micros = net, "CRITICAL: ledger imbalance detected");

            match store::ledger_currency_imbalances(&mut *conn).await {
                Ok(imbalances) => {
                    for (currency, net_micros) in imbalances {
                        observability::increment_ledger_imbalance(&currency);
                        tracing::error!(
                            currency,
                            net_micros,
                            "ledger imbalance by currency"
                        );
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, "failed to load currency imbalances");
                }
            }
            return Ok(());
        }

        tracing::info!("ledger balanced");
        Ok(())
    }
}
