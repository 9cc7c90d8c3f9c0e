//! Persistence collaborator.
//!
//! The core treats storage as a key-value store: quota entries keyed by
//! (user, day), grid records keyed by grid id. In-memory state stays
//! authoritative while the process runs; these stores let it survive restarts.
//! User settings and saved references live only here.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::models::{GridId, GridRecord, QuotaEntry, ReferenceSlot, UserId, UserSettings};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn load_quota(&self, user_id: UserId, day: NaiveDate) -> anyhow::Result<Option<QuotaEntry>>;

    /// Saves a committed count. Counts never go down, so implementations keep
    /// the larger of the stored and supplied values.
    async fn save_quota(&self, entry: &QuotaEntry) -> anyhow::Result<()>;
}

#[async_trait]
pub trait GridStore: Send + Sync {
    async fn load_grid(&self, grid_id: GridId) -> anyhow::Result<Option<GridRecord>>;

    async fn save_grid(&self, record: &GridRecord) -> anyhow::Result<()>;

    /// Removes every record expired at `now`, including ones written before a
    /// restart, and returns what was removed.
    async fn delete_expired(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<GridRecord>>;
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn load_settings(&self, user_id: UserId) -> anyhow::Result<Option<UserSettings>>;

    async fn save_settings(&self, settings: &UserSettings) -> anyhow::Result<()>;
}

#[async_trait]
pub trait ReferenceStore: Send + Sync {
    /// Filled slots, lowest slot first.
    async fn list_references(&self, user_id: UserId) -> anyhow::Result<Vec<ReferenceSlot>>;

    /// Inserts or replaces the image in `reference.slot`.
    async fn save_reference(&self, reference: &ReferenceSlot) -> anyhow::Result<()>;

    /// Returns whether the slot held an image.
    async fn delete_reference(&self, user_id: UserId, slot: u8) -> anyhow::Result<bool>;

    /// Returns how many slots were cleared.
    async fn clear_references(&self, user_id: UserId) -> anyhow::Result<u64>;
}
