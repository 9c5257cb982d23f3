//! Reconciliation Worker
//!
//! Runs the ledger-sum check once at startup and then on a long interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::observability;
use crate::reconciliation::ReconciliationService;

pub struct ReconciliationWorker {
    service: Arc<ReconciliationService>,
    interval: Duration,
    stop_tx: watch::Sender<bool>,
}

impl ReconciliationWorker {
    pub fn new(service: Arc<ReconciliationService>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            service,
            interval: Duration::from_secs(24 * 3600),
            stop_tx,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        if interval > Duration::ZERO {
            self.interval = interval;
        }
        self
    }

    /// Run until stopped. The first check runs immediately.
    pub async fn start(&self) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            "reconciliation worker starting"
        );

        let mut stop_rx = self.stop_tx.subscribe();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = async { let _ = stop_rx.wait_for(|stop| *stop).await; } => {
                    tracing::info!("reconciliation worker stop signal received");
                    return;
                }
                // First tick fires immediately: run once at startup.
                _ = ticker.tick() => {
                    self.run_once().await;
                }
            }
        }
    }

    /// Signal the loop to stop. Idempotent.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Spawn the loop on its own task; the returned handle stops it.
    pub fn spawn(self: Arc<Self>) -> impl FnOnce() {
        let worker = self.clone();
        tokio::spawn(async move {
            worker.start().await;
        });
        move || self.stop()
    }

    async fn run_once(&self) {
        match self.service.run().await {
            Ok(()) => observability::increment_worker_run("reconciliation", "success"),
            Err(err) => {
                tracing::error!(error = %err, "reconciliation run failed");
                observability::increment_worker_run("reconciliation", "failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_interval_rejects_zero() {
        let pool = sqlx::PgPool::connect_lazy("postgres://localhost/payflow_test").unwrap();
        let service = Arc::new(ReconciliationService::new(pool));
        let worker = ReconciliationWorker::new(service).with_interval(Duration::ZERO);
        assert_eq!(worker.interval, Duration::from_secs(24 * 3600));
    }
}
