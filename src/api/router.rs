//! HTTP Router
//!
//! Route map per the public API surface. Mutating money-movement routes
//! carry the idempotency middleware inside the auth middleware; the
//! webhook authenticates by signature instead of JWT.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::{middleware, Router};
use tower_http::trace::TraceLayer;

use super::auth::jwt_auth_middleware;
use super::handlers;
use super::state::AppState;
use super::trace;
use crate::idempotency::idempotency_middleware;

pub fn build_router(state: Arc<AppState>) -> Router {
    let idempotent_routes = Router::new()
        .route(
            "/v1/transfers/internal",
            post(handlers::transfer::create_transfer),
        )
        .route(
            "/v1/transfers/exchange",
            post(handlers::transfer::create_exchange),
        )
        .route("/v1/payouts", post(handlers::payout::request_payout))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            idempotency_middleware,
        ))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            jwt_auth_middleware,
        ));

    let authed_routes = Router::new()
        .route("/v1/payouts/{id}", get(handlers::payout::get_payout))
        .route(
            "/v1/payouts/manual-review",
            get(handlers::payout::list_manual_review),
        )
        .route(
            "/v1/payouts/{id}/resolve",
            post(handlers::payout::resolve_manual_review),
        )
        .route("/v1/admin/users", post(handlers::account::create_user))
        .route("/v1/admin/accounts", post(handlers::account::create_account))
        .route("/v1/accounts/{id}", get(handlers::account::get_account))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            jwt_auth_middleware,
        ));

    Router::new()
        .merge(idempotent_routes)
        .merge(authed_routes)
        .route("/v1/webhooks/deposit", post(handlers::webhook::deposit))
        .route("/healthz", get(handlers::health::liveness))
        .route("/readyz", get(handlers::health::readiness))
        // Runs after routing so MatchedPath is available for the latency
        // label; unmatched requests are not recorded.
        .route_layer(middleware::from_fn(trace::metrics_middleware))
        .layer(middleware::from_fn(trace::trace_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
