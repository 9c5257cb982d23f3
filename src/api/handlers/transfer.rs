//! Transfer Handlers

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Deserialize;
use uuid::Uuid;

use crate::api::auth::AuthUser;
use crate::api::problem::Problem;
use crate::api::state::AppState;
use crate::domain::Currency;
use crate::ledger::ExchangeCmd;
use crate::models::Transaction;
use crate::store;

#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    pub from_account_id: Uuid,
    pub to_account_id: Uuid,
    pub amount_micros: i64,
    pub reference_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ExchangeRequest {
    pub from_account_id: Uuid,
    pub to_account_id: Uuid,
    pub amount_micros: i64,
    pub from_currency: String,
    pub to_currency: String,
    pub reference_id: String,
}

/// The caller must own the source account (admins may move any funds).
async fn ensure_source_ownership(
    state: &AppState,
    user: &AuthUser,
    account_id: Uuid,
) -> Result<(), Problem> {
    if user.is_admin() {
        return Ok(());
    }
    let mut conn = state.pool.acquire().await.map_err(internal)?;
    let account = store::get_account(&mut *conn, account_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| {
            Problem::new(
                StatusCode::NOT_FOUND,
                "account/not-found",
                format!("account not found: {}", account_id),
            )
        })?;
    if account.user_id != user.user_id {
        return Err(Problem::new(
            StatusCode::FORBIDDEN,
            "auth/not-owner",
            "not the owner of the source account",
        ));
    }
    Ok(())
}

fn internal(err: sqlx::Error) -> Problem {
    tracing::error!(error = %err, "storage error in transfer handler");
    Problem::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal",
        "internal server error",
    )
}

/// POST /v1/transfers/internal
pub async fn create_transfer(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<TransferRequest>,
) -> Result<(StatusCode, Json<Transaction>), Problem> {
    ensure_source_ownership(&state, &user, req.from_account_id).await?;

    let transaction = state
        .transfers
        .transfer(
            req.from_account_id,
            req.to_account_id,
            req.amount_micros,
            &req.reference_id,
        )
        .await
        .map_err(|err| Problem::from(&err))?;

    Ok((StatusCode::CREATED, Json(transaction)))
}

/// POST /v1/transfers/exchange
pub async fn create_exchange(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<ExchangeRequest>,
) -> Result<(StatusCode, Json<Transaction>), Problem> {
    let from_currency = parse_currency(&req.from_currency)?;
    let to_currency = parse_currency(&req.to_currency)?;

    ensure_source_ownership(&state, &user, req.from_account_id).await?;

    let transaction = state
        .transfers
        .exchange(ExchangeCmd {
            from_account_id: req.from_account_id,
            to_account_id: req.to_account_id,
            amount_micros: req.amount_micros,
            from_currency,
            to_currency,
            reference_id: req.reference_id,
        })
        .await
        .map_err(|err| Problem::from(&err))?;

    Ok((StatusCode::CREATED, Json(transaction)))
}

fn parse_currency(raw: &str) -> Result<Currency, Problem> {
    Currency::parse(raw).ok_or_else(|| {
        Problem::new(
            StatusCode::BAD_REQUEST,
            "validation/unsupported-currency",
            format!("unsupported currency: {}", raw),
        )
    })
}
