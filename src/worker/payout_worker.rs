//! Payout Worker
//!
//! Tick loop that drives the payout engine. Safe to run in multiple
//! process replicas: claims are serialized by FOR UPDATE SKIP LOCKED in
//! the database, not by anything in this process.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::observability;
use crate::payout::{PayoutError, PayoutService};

pub struct PayoutWorker {
    service: Arc<PayoutService>,
    poll_interval: Duration,
    batch_size: i64,
    stop_tx: watch::Sender<bool>,
}

impl PayoutWorker {
    pub fn new(service: Arc<PayoutService>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            service,
            poll_interval: Duration::from_secs(10),
            batch_size: 10,
            stop_tx,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Run the tick loop until [`stop`](Self::stop) is called.
    ///
    /// No database transaction is held across ticks. On shutdown the
    /// in-flight batch requeues its unattempted claims before this
    /// returns.
    pub async fn start(&self) {
        tracing::info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            batch_size = self.batch_size,
            "payout worker starting"
        );

        let mut stop_rx = self.stop_tx.subscribe();
        let batch_stop_rx = stop_rx.clone();
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // interval fires immediately; consume the first tick so the loop
        // waits one full period like a plain ticker.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = async { let _ = stop_rx.wait_for(|stop| *stop).await; } => {
                    tracing::info!("payout worker stop signal received");
                    return;
                }
                _ = ticker.tick() => {
                    self.process_batch(batch_stop_rx.clone()).await;
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

    async fn process_batch(&self, shutdown: watch::Receiver<bool>) {
        match self
            .service
            .process_payouts_with_shutdown(self.batch_size, shutdown)
            .await
        {
            Ok(()) => observability::increment_worker_run("payout", "success"),
            Err(PayoutError::Cancelled) => {
                tracing::info!("payout batch cancelled; claims requeued");
                observability::increment_worker_run("payout", "cancelled");
            }
            Err(err) => {
                // Never fatal: the next tick retries.
                tracing::error!(error = %err, "payout batch failed");
                observability::increment_worker_run("payout", "failed");
            }
        }
    }

    /// Process a single batch immediately. Useful for tests and manual
    /// triggering.
    pub async fn process_once(&self) -> Result<(), PayoutError> {
        self.service.process_payouts(self.batch_size).await
    }
}
