//! HTTP Surface
//!
//! Router, middleware and handlers consuming the core engines. Errors
//! leave as RFC 7807 `problem+json`.

pub mod auth;
pub mod handlers;
pub mod problem;
pub mod router;
pub mod state;
pub mod trace;

pub use router::build_router;
pub use state::AppState;
