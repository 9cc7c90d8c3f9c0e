use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;

use crate::models::{GridId, GridRecord, QuotaEntry, ReferenceSlot, UserId, UserSettings};
use crate::store::{GridStore, QuotaStore, ReferenceStore, SettingsStore};

/// Process-local store used when no database is configured, and in tests.
#[derive(Default)]
pub struct MemoryStore {
    quotas: Mutex<HashMap<(UserId, NaiveDate), u32>>,
    grids: Mutex<HashMap<GridId, GridRecord>>,
    settings: Mutex<HashMap<UserId, UserSettings>>,
    references: Mutex<BTreeMap<(UserId, u8), ReferenceSlot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QuotaStore for MemoryStore {
    async fn load_quota(&self, user_id: UserId, day: NaiveDate) -> anyhow::Result<Option<QuotaEntry>> {
        Ok(self
            .quotas
            .lock()
            .get(&(user_id, day))
            .map(|&count| QuotaEntry { user_id, day, count }))
    }

    async fn save_quota(&self, entry: &QuotaEntry) -> anyhow::Result<()> {
        let mut quotas = self.quotas.lock();
        let stored = quotas.entry((entry.user_id, entry.day)).or_insert(0);
        *stored = (*stored).max(entry.count);
        Ok(())
    }
}

#[async_trait]
impl GridStore for MemoryStore {
    async fn load_grid(&self, grid_id: GridId) -> anyhow::Result<Option<GridRecord>> {
        Ok(self.grids.lock().get(&grid_id).cloned())
    }

    async fn save_grid(&self, record: &GridRecord) -> anyhow::Result<()> {
        self.grids.lock().insert(record.grid_id, record.clone());
        Ok(())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<GridRecord>> {
        let mut grids = self.grids.lock();
        let expired: Vec<GridId> = grids
            .values()
            .filter(|r| r.is_expired(now))
            .map(|r| r.grid_id)
            .collect();
        Ok(expired
            .into_iter()
            .filter_map(|grid_id| grids.remove(&grid_id))
            .collect())
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn load_settings(&self, user_id: UserId) -> anyhow::Result<Option<UserSettings>> {
        Ok(self.settings.lock().get(&user_id).cloned())
    }

    async fn save_settings(&self, settings: &UserSettings) -> anyhow::Result<()> {
        self.settings
            .lock()
            .insert(settings.user_id, settings.clone());
        Ok(())
    }
}

#[async_trait]
impl ReferenceStore for MemoryStore {
    async fn list_references(&self, user_id: UserId) -> anyhow::Result<Vec<ReferenceSlot>> {
        Ok(self
            .references
            .lock()
            .range((user_id, u8::MIN)..=(user_id, u8::MAX))
            .map(|(_, reference)| reference.clone())
            .collect())
    }

    async fn save_reference(&self, reference: &ReferenceSlot) -> anyhow::Result<()> {
        self.references
            .lock()
            .insert((reference.user_id, reference.slot), reference.clone());
        Ok(())
    }

    async fn delete_reference(&self, user_id: UserId, slot: u8) -> anyhow::Result<bool> {
        Ok(self.references.lock().remove(&(user_id, slot)).is_some())
    }

    async fn clear_references(&self, user_id: UserId) -> anyhow::Result<u64> {
        let mut references = self.references.lock();
        let before = references.len();
        references.retain(|&(owner, _), _| owner != user_id);
        Ok((before - references.len()) as u64)
    }
}
