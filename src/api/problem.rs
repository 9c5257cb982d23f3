//! RFC 7807 Problem Responses
//!
//! Every error leaving the HTTP boundary is an `application/problem+json`
//! envelope with `type`, `title`, `status`, `detail`, `instance` and
//! `request_id`.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::idempotency::IdempotencyError;
use crate::ledger::LedgerError;
use crate::payout::PayoutError;
use crate::webhook::WebhookError;

#[derive(Debug, Clone, Serialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub instance: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub request_id: String,
}

impl Problem {
    pub fn new(status: StatusCode, type_slug: &str, detail: impl Into<String>) -> Self {
        Self {
            problem_type: format!("/problems/{}", type_slug),
            title: status
                .canonical_reason()
                .unwrap_or("Unknown")
                .to_string(),
            status: status.as_u16(),
            detail: detail.into(),
            instance: String::new(),
            request_id: String::new(),
        }
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = instance.into();
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    fn from_status(status: u16, code: &str, detail: String) -> Self {
        let status =
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        // Infrastructure detail stays in the logs, not in responses.
        let detail = if status.is_server_error() {
            "internal server error".to_string()
        } else {
            detail
        };
        Problem::new(status, &code.to_lowercase().replace('_', "-"), detail)
    }
}

impl From<&LedgerError> for Problem {
    fn from(err: &LedgerError) -> Self {
        Problem::from_status(err.http_status(), err.code(), err.to_string())
    }
}

impl From<&PayoutError> for Problem {
    fn from(err: &PayoutError) -> Self {
        Problem::from_status(err.http_status(), err.code(), err.to_string())
    }
}

impl From<&WebhookError> for Problem {
    fn from(err: &WebhookError) -> Self {
        let slug = match err {
            WebhookError::InvalidSignature => "webhook/invalid-signature",
            WebhookError::PayloadMismatch => "webhook/payload-mismatch",
            WebhookError::InProgress => "webhook/in-progress",
            _ => "webhook/invalid-payload",
        };
        let status = StatusCode::from_u16(err.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let detail = if status.is_server_error() {
            "internal server error".to_string()
        } else {
            err.to_string()
        };
        Problem::new(status, slug, detail)
    }
}

impl From<&IdempotencyError> for Problem {
    fn from(err: &IdempotencyError) -> Self {
        match err {
            IdempotencyError::HashMismatch => Problem::new(
                StatusCode::CONFLICT,
                "idempotency/key-conflict",
                "conflicting idempotency key",
            ),
            IdempotencyError::InProgress => Problem::new(
                StatusCode::CONFLICT,
                "idempotency/in-progress",
                "idempotency processing",
            ),
            IdempotencyError::NotFound => Problem::new(
                StatusCode::NOT_FOUND,
                "idempotency/not-found",
                "idempotency key not found",
            ),
            IdempotencyError::Database(_) => Problem::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "idempotency/unavailable",
                "idempotency unavailable",
            ),
        }
    }
}

impl IntoResponse for Problem {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::to_vec(&self).unwrap_or_default();
        (
            status,
            [(header::CONTENT_TYPE, "application/problem+json")],
            body,
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_problem_shape() {
        let p = Problem::new(StatusCode::BAD_REQUEST, "validation", "amount must be positive")
            .with_instance("/v1/transfers/internal")
            .with_request_id("req-1");
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["type"], "/problems/validation");
        assert_eq!(json["title"], "Bad Request");
        assert_eq!(json["status"], 400);
        assert_eq!(json["detail"], "amount must be positive");
        assert_eq!(json["instance"], "/v1/transfers/internal");
        assert_eq!(json["request_id"], "req-1");
    }

    #[test]
    fn test_ledger_error_mapping() {
        let p = Problem::from(&LedgerError::InsufficientFunds);
        assert_eq!(p.status, 400);
        assert_eq!(p.problem_type, "/problems/insufficient-funds");
    }

    #[test]
    fn test_server_errors_hide_detail() {
        let p = Problem::from(&LedgerError::Database("password=hunter2".into()));
        assert_eq!(p.status, 500);
        assert_eq!(p.detail, "internal server error");
    }

    #[test]
    fn test_idempotency_conflict_mapping() {
        let p = Problem::from(&IdempotencyError::HashMismatch);
        assert_eq!(p.status, 409);
    }
}
