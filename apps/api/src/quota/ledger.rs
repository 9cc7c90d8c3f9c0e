use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::ErrorKind;
use crate::models::{QuotaEntry, UserId};
use crate::quota::DayBoundary;
use crate::store::QuotaStore;

/// A held unit of quota. Settled exactly once by `commit` or `release`;
/// settling it again is a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub id: Uuid,
    pub user_id: UserId,
    pub day: NaiveDate,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuotaUsage {
    pub day: NaiveDate,
    pub used: u32,
    pub reserved: u32,
    pub limit: u32,
    pub remaining: u32,
    pub resets_in_secs: u64,
}

#[derive(Debug, Default)]
struct DayBucket {
    committed: u32,
    pending: HashSet<Uuid>,
    loaded: bool,
}

impl DayBucket {
    fn in_use(&self) -> u32 {
        self.committed + self.pending.len() as u32
    }
}

/// Buckets for one user. Older days are dropped once nothing is pending on them.
#[derive(Debug, Default)]
struct UserQuota {
    days: BTreeMap<NaiveDate, DayBucket>,
}

impl UserQuota {
    fn bucket(&mut self, day: NaiveDate) -> &mut DayBucket {
        self.days.entry(day).or_default()
    }

    fn prune_before(&mut self, day: NaiveDate) {
        self.days
            .retain(|&d, bucket| d >= day || !bucket.pending.is_empty());
    }
}

/// Tracks per-user daily generation counts.
///
/// Each user has their own lock; the outer map lock is only held long enough
/// to find or create that user's slot. Store I/O never happens under either.
pub struct QuotaLedger {
    daily_limit: u32,
    boundary: DayBoundary,
    users: Mutex<HashMap<UserId, Arc<Mutex<UserQuota>>>>,
    store: Arc<dyn QuotaStore>,
}

impl QuotaLedger {
    pub fn new(daily_limit: u32, boundary: DayBoundary, store: Arc<dyn QuotaStore>) -> Self {
        Self {
            daily_limit,
            boundary,
            users: Mutex::new(HashMap::new()),
            store,
        }
    }

    pub fn daily_limit(&self) -> u32 {
        self.daily_limit
    }

    /// Reserves one generation for `user_id` in `day`, or denies with
    /// `DailyLimitExceeded` when committed plus pending work already fills the
    /// limit.
    pub async fn check_and_reserve(
        &self,
        user_id: UserId,
        day: NaiveDate,
    ) -> Result<Reservation, ErrorKind> {
        let slot = self.slot(user_id);
        self.ensure_loaded(&slot, user_id, day).await;

        let mut quota = slot.lock();
        quota.prune_before(day);
        let bucket = quota.bucket(day);

        if bucket.in_use() >= self.daily_limit {
            info!(
                "Quota denied for user {user_id} on {day}: {}/{} used, {} pending",
                bucket.committed,
                self.daily_limit,
                bucket.pending.len()
            );
            return Err(ErrorKind::DailyLimitExceeded);
        }

        let id = Uuid::new_v4();
        bucket.pending.insert(id);
        debug!(
            "Reserved quota {id} for user {user_id} on {day} ({}/{})",
            bucket.in_use(),
            self.daily_limit
        );
        Ok(Reservation { id, user_id, day })
    }

    /// Reserves against the current day bucket.
    pub async fn reserve_today(&self, user_id: UserId) -> Result<Reservation, ErrorKind> {
        self.check_and_reserve(user_id, self.boundary.today()).await
    }

    /// Turns a reservation into a consumed generation and persists the new
    /// committed count. Returns `false` if the reservation was already settled.
    pub async fn commit(&self, reservation: &Reservation) -> bool {
        let slot = self.slot(reservation.user_id);
        let entry = {
            let mut quota = slot.lock();
            let bucket = quota.bucket(reservation.day);
            if !bucket.pending.remove(&reservation.id) {
                debug!("Quota reservation {} already settled", reservation.id);
                return false;
            }
            bucket.committed += 1;
            QuotaEntry {
                user_id: reservation.user_id,
                day: reservation.day,
                count: bucket.committed,
            }
        };

        if let Err(e) = self.store.save_quota(&entry).await {
            warn!(
                "Failed to persist quota for user {} on {}: {e:#}",
                entry.user_id, entry.day
            );
        }
        true
    }

    /// Returns the reserved unit without consuming it. Returns `false` if the
    /// reservation was already settled.
    pub fn release(&self, reservation: &Reservation) -> bool {
        let slot = self.slot(reservation.user_id);
        let mut quota = slot.lock();
        let released = quota
            .days
            .get_mut(&reservation.day)
            .map(|bucket| bucket.pending.remove(&reservation.id))
            .unwrap_or(false);
        if released {
            debug!(
                "Released quota {} for user {}",
                reservation.id, reservation.user_id
            );
        }
        released
    }

    pub async fn usage(&self, user_id: UserId) -> QuotaUsage {
        let now = Utc::now();
        let day = self.boundary.bucket_for(now);
        let slot = self.slot(user_id);
        self.ensure_loaded(&slot, user_id, day).await;

        let mut quota = slot.lock();
        let bucket = quota.bucket(day);
        QuotaUsage {
            day,
            used: bucket.committed,
            reserved: bucket.pending.len() as u32,
            limit: self.daily_limit,
            remaining: self.daily_limit.saturating_sub(bucket.in_use()),
            resets_in_secs: self.boundary.time_until_reset(now).as_secs(),
        }
    }

    /// Forgets users with nothing pending and no bucket for the current day.
    /// Committed counts are persisted, so a returning user reloads them.
    pub fn prune_idle(&self) -> usize {
        self.prune_idle_before(self.boundary.today())
    }

    fn prune_idle_before(&self, today: NaiveDate) -> usize {
        let mut users = self.users.lock();
        let before = users.len();
        users.retain(|_, slot| {
            // Someone is between `slot()` and settling; leave it alone.
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            let mut quota = slot.lock();
            quota.prune_before(today);
            !quota.days.is_empty()
        });
        let pruned = before - users.len();
        if pruned > 0 {
            debug!("Pruned {pruned} idle quota slot(s)");
        }
        pruned
    }

    fn slot(&self, user_id: UserId) -> Arc<Mutex<UserQuota>> {
        self.users.lock().entry(user_id).or_default().clone()
    }

    /// Seeds the day bucket from the store the first time it is touched.
    /// Concurrent first loads merge by taking the larger count.
    async fn ensure_loaded(&self, slot: &Mutex<UserQuota>, user_id: UserId, day: NaiveDate) {
        let loaded = slot.lock().days.get(&day).is_some_and(|b| b.loaded);
        if loaded {
            return;
        }

        let persisted = match self.store.load_quota(user_id, day).await {
            Ok(entry) => entry.map(|e| e.count).unwrap_or(0),
            Err(e) => {
                warn!("Failed to load quota for user {user_id} on {day}: {e:#}");
                0
            }
        };

        let mut quota = slot.lock();
        let bucket = quota.bucket(day);
        bucket.committed = bucket.committed.max(persisted);
        bucket.loaded = true;
    }
}
