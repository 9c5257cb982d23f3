//! Background Workers
//!
//! Tick loops for payout processing and ledger reconciliation. Shutdown is
//! a watch flag; stopping is idempotent and never interrupts an in-flight
//! database write.

pub mod payout_worker;
pub mod reconciliation_worker;

pub use payout_worker::PayoutWorker;
pub use reconciliation_worker::ReconciliationWorker;
