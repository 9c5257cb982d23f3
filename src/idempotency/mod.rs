//! Idempotency Layer
//!
//! At-most-once execution for mutating HTTP requests carrying an
//! `Idempotency-Key` header: a durable store of truth with an optional
//! redis fast path, and the middleware that wraps mutating routes.

pub mod middleware;
pub mod store;

pub use middleware::{hash_request, idempotency_middleware};
pub use store::{IdempotencyError, Record, Store};
