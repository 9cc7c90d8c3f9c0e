//! Per-user daily quota.
//!
//! Policy: reserve at submission, commit on success, release on failure or
//! expiry. Only committed counts are persisted.

pub mod day;
pub mod handlers;
pub mod ledger;

pub use day::DayBoundary;
pub use ledger::{QuotaLedger, QuotaUsage, Reservation};
