//! Idempotency Middleware
//!
//! Enforces the `Idempotency-Key` contract for mutating requests: replay
//! finished responses, serialize concurrent retries, and capture the
//! handler's response for future replays. Every outcome increments
//! `idempotency_events_total{outcome}`.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderValue, Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};

use super::store::{IdempotencyError, Record};
use crate::api::problem::Problem;
use crate::api::state::AppState;
use crate::observability;

const IDEMPOTENCY_HEADER: &str = "idempotency-key";
const REPLAY_HEADER: &str = "x-idempotent-replay";

fn is_mutating(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

/// SHA-256 over `method|path|body`, hex encoded.
pub fn hash_request(method: &str, path: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update(b"|");
    hasher.update(path.as_bytes());
    hasher.update(b"|");
    hasher.update(body);
    hex::encode(hasher.finalize())
}

pub async fn idempotency_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(store) = &state.idempotency else {
        return next.run(request).await;
    };
    if !is_mutating(request.method()) {
        return next.run(request).await;
    }

    let key = match request
        .headers()
        .get(IDEMPOTENCY_HEADER)
        .and_then(|h| h.to_str().ok())
        .filter(|k| !k.is_empty())
    {
        Some(key) => key.to_string(),
        None => {
            observability::increment_idempotency_event("missing_key");
            return Problem::new(
                StatusCode::BAD_REQUEST,
                "idempotency/missing-key",
                "Idempotency-Key header is required",
            )
            .into_response();
        }
    };

    // Rebuffer the body so the handler still sees it.
    let (parts, body) = request.into_parts();
    let body_bytes = match axum::body::to_bytes(body, 1024 * 1024).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return Problem::new(
                StatusCode::BAD_REQUEST,
                "request/invalid-body",
                "Failed to read request body",
            )
            .into_response();
        }
    };
    let method = parts.method.to_string();
    let path = parts.uri.path().to_string();
    let request_hash = hash_request(&method, &path, &body_bytes);
    let request = Request::from_parts(parts, Body::from(body_bytes));

    match store.lookup(&key, &request_hash).await {
        Ok(record) => {
            observability::increment_idempotency_event("replay");
            return respond_from_record(&record);
        }
        Err(IdempotencyError::HashMismatch) => {
            observability::increment_idempotency_event("hash_mismatch");
            return Problem::new(
                StatusCode::CONFLICT,
                "idempotency/key-conflict",
                "conflicting idempotency key",
            )
            .into_response();
        }
        Err(IdempotencyError::InProgress) => {
            return match store.wait_for_completion(&key, &request_hash).await {
                Ok(record) => {
                    observability::increment_idempotency_event("replay_after_wait");
                    respond_from_record(&record)
                }
                Err(err) => {
                    observability::increment_idempotency_event("in_progress_conflict");
                    tracing::warn!(error = %err, key, "idempotency wait failed");
                    Problem::from(&IdempotencyError::InProgress).into_response()
                }
            };
        }
        Err(IdempotencyError::NotFound) => {}
        Err(err) => {
            observability::increment_idempotency_event("lookup_error");
            tracing::warn!(error = %err, key, "idempotency lookup failed");
        }
    }

    match store.reserve(&key, &request_hash, &method, &path).await {
        Err(err) => {
            observability::increment_idempotency_event("reserve_error");
            tracing::error!(error = %err, key, "idempotency reserve failed");
            return Problem::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "idempotency/unavailable",
                "idempotency unavailable",
            )
            .into_response();
        }
        Ok(false) => {
            // Another concurrent request holds the reservation.
            return match store.wait_for_completion(&key, &request_hash).await {
                Ok(record) => {
                    observability::increment_idempotency_event("replay_after_reserve");
                    respond_from_record(&record)
                }
                Err(err) => {
                    observability::increment_idempotency_event("in_progress_conflict");
                    tracing::warn!(error = %err, key, "idempotency wait failed");
                    Problem::from(&IdempotencyError::InProgress).into_response()
                }
            };
        }
        Ok(true) => {
            observability::increment_idempotency_event("reserved");
        }
    }

    // Execute the handler, capturing status and body for replay.
    let response = next.run(request).await;
    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("application/json")
        .to_string();

    let (mut resp_parts, resp_body) = response.into_parts();
    let resp_bytes = match axum::body::to_bytes(resp_body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(err) => {
            observability::increment_idempotency_event("finalize_error");
            tracing::warn!(error = %err, key, "idempotency response capture failed");
            return Problem::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "idempotency/unavailable",
                "response capture failed",
            )
            .into_response();
        }
    };

    match store
        .finalize(&key, &request_hash, status.as_u16(), &resp_bytes, &content_type)
        .await
    {
        Ok(_) => observability::increment_idempotency_event("finalized"),
        Err(err) => {
            observability::increment_idempotency_event("finalize_error");
            tracing::warn!(error = %err, key, "idempotency finalize failed");
        }
    }

    resp_parts.headers.remove(header::CONTENT_LENGTH);
    Response::from_parts(resp_parts, Body::from(resp_bytes))
}

fn respond_from_record(record: &Record) -> Response {
    let status = StatusCode::from_u16(record.status).unwrap_or(StatusCode::OK);
    let mut response = Response::new(Body::from(record.body.clone()));
    *response.status_mut() = status;
    if let Ok(value) = HeaderValue::from_str(&record.content_type) {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    response
        .headers_mut()
        .insert(REPLAY_HEADER, HeaderValue::from_static("hit"));
    if let Ok(value) = HeaderValue::from_str(record.served_by) {
        response.headers_mut().insert("x-idempotent-source", value);
    }
    response
}
