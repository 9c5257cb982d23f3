//! Webhook Handlers

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;

use crate::api::problem::Problem;
use crate::api::state::AppState;
use crate::webhook::DepositResponse;

const SIGNATURE_HEADER: &str = "x-webhook-signature";

/// POST /v1/webhooks/deposit
///
/// Authenticated by the HMAC signature over the raw payload, not by JWT.
pub async fn deposit(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<DepositResponse>, Problem> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");

    let response = state
        .webhooks
        .handle_deposit(&body, signature)
        .await
        .map_err(|err| Problem::from(&err))?;

    Ok(Json(response))
}
