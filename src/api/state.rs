//! Shared Application State

use std::sync::Arc;

use sqlx::PgPool;

use super::auth::AuthVerifier;
use crate::idempotency;
use crate::ledger::TransferService;
use crate::payout::PayoutService;
use crate::webhook::WebhookService;

pub struct AppState {
    pub pool: PgPool,
    pub transfers: TransferService,
    pub payouts: Arc<PayoutService>,
    pub webhooks: WebhookService,
    /// None disables the idempotency middleware (tests, tooling).
    pub idempotency: Option<idempotency::Store>,
    pub auth: AuthVerifier,
}
