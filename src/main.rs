use std::sync::Arc;

use anyhow::Context;
use payflow::api::auth::AuthVerifier;
use payflow::api::{build_router, AppState};
use payflow::idempotency;
use payflow::ledger::{MockExchangeRateService, TransferService};
use payflow::payout::{MockGateway, PayoutService};
use payflow::reconciliation::ReconciliationService;
use payflow::webhook::WebhookService;
use payflow::worker::{PayoutWorker, ReconciliationWorker};
use payflow::{Config, Database};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;
    let _log_guard = payflow::logging::init_logging(&config);
    payflow::observability::init(config.metrics_port)?;

    let db = Database::connect(&config.database_url)
        .await
        .context("connect to database")?;
    db.migrate().await.context("run migrations")?;
    let pool = db.pool().clone();

    let redis = match &config.redis_url {
        Some(url) => match connect_redis(url).await {
            Ok(manager) => Some(manager),
            Err(err) => {
                tracing::warn!(error = %err, "redis unavailable; idempotency cache disabled");
                None
            }
        },
        None => None,
    };

    let transfers = TransferService::new(pool.clone(), Arc::new(MockExchangeRateService::new()));
    let payouts = Arc::new(PayoutService::new(pool.clone(), Arc::new(MockGateway::new())));
    let webhooks = WebhookService::new(
        pool.clone(),
        &config.webhook_hmac_key,
        config.webhook_skip_signature,
    );
    let idempotency_store =
        idempotency::Store::new(redis, pool.clone(), config.idempotency_ttl);
    let auth = AuthVerifier::new(&config.jwt_secret, &config.jwt_issuer, &config.jwt_audience);

    let payout_worker = Arc::new(
        PayoutWorker::new(payouts.clone())
            .with_poll_interval(config.payout_poll_interval)
            .with_batch_size(config.payout_batch_size),
    );
    let reconciliation_worker = Arc::new(
        ReconciliationWorker::new(Arc::new(ReconciliationService::new(pool.clone())))
            .with_interval(config.reconciliation_interval),
    );
    let stop_payout_worker = payout_worker.spawn();
    let stop_reconciliation_worker = reconciliation_worker.spawn();

    let state = Arc::new(AppState {
        pool,
        transfers,
        payouts,
        webhooks,
        idempotency: Some(idempotency_store),
        auth,
    });
    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {}", addr))?;
    tracing::info!(%addr, "payflow listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")?;

    // Workers stop after the HTTP server drains; in-flight payout claims
    // are requeued by the worker before its loop exits.
    stop_payout_worker();
    stop_reconciliation_worker();

    Ok(())
}

async fn connect_redis(url: &str) -> anyhow::Result<redis::aio::ConnectionManager> {
    let client = redis::Client::open(url).context("parse redis url")?;
    let manager = client
        .get_connection_manager()
        .await
        .context("connect redis")?;
    Ok(manager)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
