//! Payout Subsystem
//!
//! Asynchronous external payouts: reservation, claim, gateway dispatch,
//! finalization, crash recovery and manual review.

pub mod error;
pub mod gateway;
pub mod service;

#[cfg(test)]
mod integration_tests;

pub use error::PayoutError;
pub use gateway::{Gateway, GatewayError, MockGateway};
pub use service::{
    ManualReviewDecision, PayoutDestination, PayoutReceipt, PayoutService, RequestPayoutCmd,
    ResolveManualReviewCmd,
};
