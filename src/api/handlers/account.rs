//! User and Account Administration

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Deserialize;
use uuid::Uuid;

use crate::api::auth::{require_admin, AuthUser};
use crate::api::problem::Problem;
use crate::api::state::AppState;
use crate::domain::Currency;
use crate::models::{Account, User};
use crate::store;

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub email: String,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateAccountRequest {
    pub user_id: Uuid,
    pub currency: String,
    #[serde(default)]
    pub balance_micros: Option<i64>,
}

/// POST /v1/admin/users -- admin only.
pub async fn create_user(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<User>), Problem> {
    require_admin(&user)?;

    let username = req.username.trim();
    let email = req.email.trim();
    if username.is_empty() || email.is_empty() {
        return Err(Problem::new(
            StatusCode::BAD_REQUEST,
            "validation/missing-field",
            "username and email are required",
        ));
    }
    let role = req.role.as_deref().unwrap_or("user");
    if !matches!(role, "user" | "admin") {
        return Err(Problem::new(
            StatusCode::BAD_REQUEST,
            "validation/invalid-role",
            format!("invalid role: {}", role),
        ));
    }

    let id = Uuid::new_v4();
    let mut conn = state.pool.acquire().await.map_err(internal)?;
    let created_at = store::create_user(&mut *conn, id, username, email, role)
        .await
        .map_err(|err| {
            if store::is_unique_violation(&err) {
                Problem::new(
                    StatusCode::CONFLICT,
                    "user/already-exists",
                    "username or email already in use",
                )
            } else {
                internal(err)
            }
        })?;

    Ok((
        StatusCode::CREATED,
        Json(User {
            id,
            username: username.to_string(),
            email: email.to_string(),
            role: role.to_string(),
            created_at,
        }),
    ))
}

/// POST /v1/admin/accounts -- admin only.
pub async fn create_account(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<CreateAccountRequest>,
) -> Result<(StatusCode, Json<Account>), Problem> {
    require_admin(&user)?;

    let currency = Currency::parse(&req.currency).ok_or_else(|| {
        Problem::new(
            StatusCode::BAD_REQUEST,
            "validation/unsupported-currency",
            format!("unsupported currency: {}", req.currency),
        )
    })?;
    let balance_micros = req.balance_micros.unwrap_or(0);
    if balance_micros < 0 {
        return Err(Problem::new(
            StatusCode::BAD_REQUEST,
            "validation/invalid-balance",
            "initial balance must not be negative",
        ));
    }

    let id = Uuid::new_v4();
    let mut conn = state.pool.acquire().await.map_err(internal)?;

    if store::get_user(&mut *conn, req.user_id)
        .await
        .map_err(internal)?
        .is_none()
    {
        return Err(Problem::new(
            StatusCode::NOT_FOUND,
            "user/not-found",
            format!("user not found: {}", req.user_id),
        ));
    }

    let created_at = store::create_account(&mut *conn, id, req.user_id, currency, balance_micros)
        .await
        .map_err(internal)?;

    Ok((
        StatusCode::CREATED,
        Json(Account {
            id,
            user_id: req.user_id,
            currency,
            balance_micros,
            locked_micros: 0,
            created_at,
        }),
    ))
}

/// GET /v1/accounts/{id} -- owner or admin.
pub async fn get_account(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(account_id): Path<Uuid>,
) -> Result<Json<Account>, Problem> {
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

    if !user.can_access_user(account.user_id) {
        return Err(Problem::new(
            StatusCode::FORBIDDEN,
            "auth/not-owner",
            "not the owner of this account",
        ));
    }

    Ok(Json(account))
}

fn internal(err: sqlx::Error) -> Problem {
    tracing::error!(error = %err, "storage error in account handler");
    Problem::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal",
        "internal server error",
    )
}
