//! Prometheus Metrics
//!
//! Installs the metrics recorder once at startup and exposes typed helpers
//! for the counters used on money-moving paths.
//!
//! # Metrics
//!
//! - `ledger_imbalance_total{currency}` - double-entry divergence detections
//! - `idempotency_events_total{outcome}` - idempotency middleware outcomes
//! - `payout_manual_review_transitions_total{action}` - manual review flow
//! - `payout_manual_review_queue_size` - payouts waiting for an operator
//! - `worker_runs_total{worker,result}` - background worker tick outcomes
//! - `http_request_duration_seconds` - request latency histogram

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and HTTP exposition listener.
///
/// Must be called once from the process entry point, never from request
/// paths. Helpers below are no-ops until this has run.
pub fn init(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!(port, "metrics exporter listening");
    Ok(())
}

pub fn observe_http(method: &str, path: &str, status: u16, duration: Duration) {
    histogram!(
        "http_request_duration_seconds",
        "method" => method.to_string(),
        "path" => path.to_string(),
        "status" => status.to_string(),
    )
    .record(duration.as_secs_f64());
}

pub fn increment_ledger_imbalance(currency: &str) {
    counter!("ledger_imbalance_total", "currency" => currency.to_string()).increment(1);
}

pub fn increment_idempotency_event(outcome: &'static str) {
    counter!("idempotency_events_total", "outcome" => outcome).increment(1);
}

pub fn increment_manual_review_transition(action: &str) {
    counter!("payout_manual_review_transitions_total", "action" => action.to_string()).increment(1);
}

pub fn set_manual_review_queue_size(size: i64) {
    gauge!("payout_manual_review_queue_size").set(size as f64);
}

pub fn increment_worker_run(worker: &'static str, result: &'static str) {
    counter!("worker_runs_total", "worker" => worker, "result" => result).increment(1);
}
