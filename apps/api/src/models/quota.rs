use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::models::UserId;

/// Committed generation count for one user in one day bucket.
/// Exactly one entry exists per (user, day).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaEntry {
    pub user_id: UserId,
    pub day: NaiveDate,
    pub count: u32,
}
