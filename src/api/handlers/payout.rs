//! Payout Handlers

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Deserialize;
use uuid::Uuid;

use crate::api::auth::{require_admin, AuthUser};
use crate::api::problem::Problem;
use crate::api::state::AppState;
use crate::domain::Currency;
use crate::models::Payout;
use crate::observability;
use crate::payout::{
    ManualReviewDecision, PayoutDestination, PayoutReceipt, RequestPayoutCmd,
    ResolveManualReviewCmd,
};
use crate::store;

#[derive(Debug, Deserialize)]
pub struct PayoutRequest {
    pub account_id: Uuid,
    pub amount_micros: i64,
    pub currency: String,
    pub destination: PayoutDestination,
    pub reference_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    pub decision: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub gateway_ref: Option<String>,
}

/// POST /v1/payouts -> 202 Accepted
pub async fn request_payout(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<PayoutRequest>,
) -> Result<(StatusCode, Json<PayoutReceipt>), Problem> {
    require_admin(&user)?;

    let currency = Currency::parse(&req.currency).ok_or_else(|| {
        Problem::new(
            StatusCode::BAD_REQUEST,
            "validation/unsupported-currency",
            format!("unsupported currency: {}", req.currency),
        )
    })?;

    let receipt = state
        .payouts
        .request_payout(RequestPayoutCmd {
            account_id: req.account_id,
            amount_micros: req.amount_micros,
            currency,
            destination: req.destination,
            reference_id: req.reference_id,
        })
        .await
        .map_err(|err| Problem::from(&err))?;

    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

/// GET /v1/payouts/{id} -- owner or admin.
pub async fn get_payout(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(payout_id): Path<Uuid>,
) -> Result<Json<Payout>, Problem> {
    let payout = state
        .payouts
        .get_payout(payout_id)
        .await
        .map_err(|err| Problem::from(&err))?;

    if !user.is_admin() {
        let mut conn = state.pool.acquire().await.map_err(internal)?;
        let account = store::get_account(&mut *conn, payout.account_id)
            .await
            .map_err(internal)?;
        let owner = account.map(|a| a.user_id);
        if owner != Some(user.user_id) {
            return Err(Problem::new(
                StatusCode::FORBIDDEN,
                "auth/not-owner",
                "not the owner of this payout",
            ));
        }
    }

    Ok(Json(payout))
}

/// GET /v1/payouts/manual-review?limit&offset -- admin only.
pub async fn list_manual_review(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Payout>>, Problem> {
    require_admin(&user)?;

    let payouts = state
        .payouts
        .list_manual_review(params.limit.unwrap_or(50), params.offset.unwrap_or(0))
        .await
        .map_err(|err| Problem::from(&err))?;
    Ok(Json(payouts))
}

/// POST /v1/payouts/{id}/resolve -- admin only.
pub async fn resolve_manual_review(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(payout_id): Path<Uuid>,
    Json(req): Json<ResolveRequest>,
) -> Result<Json<Payout>, Problem> {
    require_admin(&user)?;

    let decision = ManualReviewDecision::parse(&req.decision).ok_or_else(|| {
        Problem::new(
            StatusCode::BAD_REQUEST,
            "payout/invalid-decision",
            format!("invalid manual review decision: {}", req.decision),
        )
    })?;

    let payout = state
        .payouts
        .resolve_manual_review(ResolveManualReviewCmd {
            payout_id,
            decision,
            reason: req.reason,
            actor_id: Some(user.user_id),
            gateway_ref: req.gateway_ref,
        })
        .await
        .map_err(|err| Problem::from(&err))?;

    if let Ok(size) = state.payouts.manual_review_queue_size().await {
        observability::set_manual_review_queue_size(size);
    }

    Ok(Json(payout))
}

fn internal(err: sqlx::Error) -> Problem {
    tracing::error!(error = %err, "storage error in payout handler");
    Problem::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal",
        "internal server error",
    )
}
