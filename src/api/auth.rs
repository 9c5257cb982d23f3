//! JWT Authentication
//!
//! HS256 bearer tokens with issuer and audience scoping. The verifier is
//! built once at startup from config; the middleware attaches the
//! authenticated principal to the request extensions.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Request, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::problem::Problem;
use super::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Admin,
    System,
}

impl Role {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(Role::User),
            "admin" => Some(Role::Admin),
            "system" => Some(Role::System),
            _ => None,
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin | Role::System)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: String,
    pub iss: String,
    pub aud: String,
    pub exp: i64,
}

/// The authenticated principal, attached to request extensions.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub role: Role,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role.is_admin()
    }

    /// Owner-or-admin check used by read endpoints.
    pub fn can_access_user(&self, owner_id: Uuid) -> bool {
        self.is_admin() || self.user_id == owner_id
    }
}

pub struct AuthVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl AuthVerifier {
    pub fn new(secret: &str, issuer: &str, audience: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[issuer]);
        validation.set_audience(&[audience]);
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> Result<AuthUser, String> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| e.to_string())?;
        let user_id = Uuid::parse_str(&data.claims.sub).map_err(|_| "invalid subject".to_string())?;
        let role = Role::parse(&data.claims.role).ok_or_else(|| "unknown role".to_string())?;
        Ok(AuthUser { user_id, role })
    }
}

/// Reject requests without a valid bearer token; attach [`AuthUser`].
pub async fn jwt_auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Problem> {
    let header_value = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| {
            Problem::new(
                StatusCode::UNAUTHORIZED,
                "auth/missing-token",
                "Missing Authorization header",
            )
        })?;

    let token = header_value.strip_prefix("Bearer ").ok_or_else(|| {
        Problem::new(
            StatusCode::UNAUTHORIZED,
            "auth/invalid-token",
            "Invalid token format",
        )
    })?;

    match state.auth.verify(token) {
        Ok(user) => {
            request.extensions_mut().insert(user);
            Ok(next.run(request).await)
        }
        Err(err) => {
            tracing::debug!(error = %err, "token verification failed");
            Err(Problem::new(
                StatusCode::UNAUTHORIZED,
                "auth/invalid-token",
                "Invalid or expired token",
            ))
        }
    }
}

/// 403 unless the principal is an admin.
pub fn require_admin(user: &AuthUser) -> Result<(), Problem> {
    if user.is_admin() {
        return Ok(());
    }
    Err(Problem::new(
        StatusCode::FORBIDDEN,
        "auth/forbidden",
        "admin role required",
    ))
}
