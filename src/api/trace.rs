//! Trace-ID Propagation and Request Metrics

use std::time::Instant;

use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::{HeaderValue, Request};
use axum::middleware::Next;
use axum::response::Response;
use uuid::Uuid;

use crate::observability;

pub const TRACE_HEADER: &str = "x-trace-id";

/// Trace id for the current request, available from extensions.
#[derive(Debug, Clone)]
pub struct TraceId(pub String);

/// Accept an incoming `X-Trace-ID` or mint one, attach it to the request
/// and echo it on the response.
pub async fn trace_middleware(mut request: Request<Body>, next: Next) -> Response {
    let trace_id = request
        .headers()
        .get(TRACE_HEADER)
        .and_then(|h| h.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    request.extensions_mut().insert(TraceId(trace_id.clone()));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert(TRACE_HEADER, value);
    }
    response
}

/// Record the request latency histogram.
///
/// The path label is the matched route template (`/v1/payouts/{id}`), not
/// the raw URI: concrete ids in the label would grow an unbounded metric
/// series per entity. Must run after routing (`route_layer`) so the
/// matched path is present; the raw path is only a fallback.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let started = Instant::now();

    let response = next.run(request).await;

    observability::observe_http(
        &method,
        &path,
        response.status().as_u16(),
        started.elapsed(),
    );
    response
}
