//! Grid Registry: rendered grids and the jobs behind them.
//!
//! Follow-up actions arrive carrying only a grid id and a button index; the
//! registry turns that back into a full derived job. Terminal jobs are kept in
//! an arena keyed by job id, so derivation chains are parent ids rather than
//! references and eviction never has to untangle anything.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::errors::ErrorKind;
use crate::generation::images::ImageStore;
use crate::models::{Candidate, GenerationJob, GridId, GridRecord, JobId, JobKind};
use crate::store::GridStore;

pub struct GridRegistry {
    records: RwLock<HashMap<GridId, GridRecord>>,
    jobs: RwLock<HashMap<JobId, GenerationJob>>,
    retention: chrono::Duration,
    store: Arc<dyn GridStore>,
    /// Candidate images are deleted together with their grid.
    images: Arc<dyn ImageStore>,
}

impl GridRegistry {
    pub fn new(
        retention: Duration,
        store: Arc<dyn GridStore>,
        images: Arc<dyn ImageStore>,
    ) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            jobs: RwLock::new(HashMap::new()),
            retention: chrono::Duration::from_std(retention)
                .unwrap_or_else(|_| chrono::Duration::days(36_500)),
            store,
            images,
        }
    }

    /// Takes ownership of a terminal job for historical lookup.
    pub fn archive(&self, job: GenerationJob) {
        self.jobs.write().insert(job.id, job);
    }

    pub fn job(&self, job_id: JobId) -> Option<GenerationJob> {
        self.jobs.read().get(&job_id).cloned()
    }

    /// Job ids from `job_id` up through its ancestors, as far as the arena
    /// still remembers them.
    pub fn lineage(&self, job_id: JobId) -> Vec<JobId> {
        let jobs = self.jobs.read();
        let mut chain = vec![job_id];
        let mut current = jobs.get(&job_id).and_then(|j| j.parent_id);
        while let Some(parent) = current {
            // Parent links only point at older jobs, but stay safe on bad data.
            if chain.contains(&parent) {
                break;
            }
            chain.push(parent);
            current = jobs.get(&parent).and_then(|j| j.parent_id);
        }
        chain
    }

    /// Creates the record for a succeeded job and archives the job.
    pub async fn record(
        &self,
        grid_id: GridId,
        job: GenerationJob,
        candidates: Vec<Candidate>,
    ) -> GridRecord {
        let created_at = Utc::now();
        let record = GridRecord {
            grid_id,
            job: job.clone(),
            candidates,
            created_at,
            expires_at: created_at + self.retention,
        };

        self.records.write().insert(grid_id, record.clone());
        self.archive(job);
        debug!(
            "Grid {grid_id} recorded for job {} ({} candidates)",
            record.job_id(),
            record.candidates.len()
        );

        if let Err(e) = self.store.save_grid(&record).await {
            warn!("Failed to persist grid {grid_id}: {e:#}");
        }
        record
    }

    /// Unknown and expired grids both resolve to `NotFound`.
    pub async fn resolve(&self, grid_id: GridId) -> Result<GridRecord, ErrorKind> {
        let now = Utc::now();

        let cached = self.records.read().get(&grid_id).cloned();
        if let Some(record) = cached {
            return if record.is_expired(now) {
                Err(ErrorKind::NotFound)
            } else {
                Ok(record)
            };
        }

        match self.store.load_grid(grid_id).await {
            Ok(Some(record)) if !record.is_expired(now) => {
                self.records.write().insert(grid_id, record.clone());
                self.jobs
                    .write()
                    .entry(record.job_id())
                    .or_insert_with(|| record.job.clone());
                debug!("Grid {grid_id} restored from store");
                Ok(record)
            }
            Ok(_) => Err(ErrorKind::NotFound),
            Err(e) => {
                warn!("Failed to load grid {grid_id}: {e:#}");
                Err(ErrorKind::NotFound)
            }
        }
    }

    pub async fn derive_upscale(&self, grid_id: GridId, index: usize) -> Result<GenerationJob, ErrorKind> {
        self.derive_from_candidate(grid_id, index, JobKind::Upscale).await
    }

    pub async fn derive_variation(
        &self,
        grid_id: GridId,
        index: usize,
    ) -> Result<GenerationJob, ErrorKind> {
        self.derive_from_candidate(grid_id, index, JobKind::Variation).await
    }

    /// Same request as the parent with a fresh seed.
    pub async fn derive_reroll(&self, grid_id: GridId) -> Result<GenerationJob, ErrorKind> {
        let record = self.resolve(grid_id).await?;
        Ok(GenerationJob::derived(
            &record.job,
            JobKind::Reroll,
            record.job.params.reseeded(),
            None,
        ))
    }

    async fn derive_from_candidate(
        &self,
        grid_id: GridId,
        index: usize,
        kind: JobKind,
    ) -> Result<GenerationJob, ErrorKind> {
        let record = self.resolve(grid_id).await?;
        let candidate = u8::try_from(index)
            .ok()
            .filter(|_| index < record.candidates.len())
            .and_then(|i| record.candidate(i))
            .ok_or(ErrorKind::InvalidIndex)?;

        Ok(GenerationJob::derived(
            &record.job,
            kind,
            record.job.params.clone(),
            Some((candidate.index, candidate.image_ref.clone())),
        ))
    }

    /// Drops records past their retention window, from the cache and the
    /// store, together with their candidate images, plus archived jobs older
    /// than the window. Jobs already derived from an evicted grid carry their
    /// own copy of everything they need.
    pub async fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let mut evicted: HashMap<GridId, GridRecord> = {
            let mut records = self.records.write();
            let expired: Vec<GridId> = records
                .values()
                .filter(|r| r.is_expired(now))
                .map(|r| r.grid_id)
                .collect();
            expired
                .into_iter()
                .filter_map(|grid_id| records.remove(&grid_id).map(|r| (grid_id, r)))
                .collect()
        };

        let cutoff = now - self.retention;
        let jobs_dropped = {
            let mut jobs = self.jobs.write();
            let before = jobs.len();
            jobs.retain(|_, job| job.submitted_at > cutoff);
            before - jobs.len()
        };

        // Rows persisted before a restart were never cached here.
        match self.store.delete_expired(now).await {
            Ok(rows) => {
                for record in rows {
                    evicted.entry(record.grid_id).or_insert(record);
                }
            }
            Err(e) => warn!("Failed to delete expired grids from store: {e:#}"),
        }

        for record in evicted.values() {
            for candidate in &record.candidates {
                if let Err(e) = self.images.delete(&candidate.image_ref).await {
                    warn!(
                        "Failed to delete image {} of grid {}: {e:#}",
                        candidate.image_ref, record.grid_id
                    );
                }
            }
        }

        if !evicted.is_empty() || jobs_dropped > 0 {
            info!(
                "Evicted {} grid(s) and {} archived job(s)",
                evicted.len(),
                jobs_dropped
            );
        }
        evicted.len()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn retention(&self) -> chrono::Duration {
        self.retention
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::images::{MemoryImageStore, StoredImage};
    use crate::models::{GenerationParams, Style, UserId};
    use crate::store::MemoryStore;

    const DAY: Duration = Duration::from_secs(86_400);

    fn succeeded_job(prompt: &str) -> GenerationJob {
        let mut params = GenerationParams::new(prompt);
        params.style = Style::Anime;
        GenerationJob::original(UserId(42), params)
    }

    fn candidates(job: &GenerationJob, n: u8) -> Vec<Candidate> {
        (0..n)
            .map(|i| Candidate {
                index: i,
                image_ref: format!("generations/{}-{i}.png", job.id),
                parent_job_id: job.id,
            })
            .collect()
    }

    fn registry(retention: Duration, store: Arc<MemoryStore>) -> GridRegistry {
        GridRegistry::new(retention, store, Arc::new(MemoryImageStore::new()))
    }

    async fn registry_with_grid(retention: Duration) -> (GridRegistry, GridId, GenerationJob) {
        let registry = registry(retention, Arc::new(MemoryStore::new()));
        let job = succeeded_job("a koi pond at dusk");
        let grid_id = GridId::new();
        registry
            .record(grid_id, job.clone(), candidates(&job, 4))
            .await;
        (registry, grid_id, job)
    }

    #[tokio::test]
    async fn test_resolve_returns_recorded_grid() {
        let (registry, grid_id, job) = registry_with_grid(DAY).await;
        let record = registry.resolve(grid_id).await.unwrap();
        assert_eq!(record.job_id(), job.id);
        assert_eq!(record.candidates.len(), 4);
        assert_eq!(registry.job(job.id), Some(job));
    }

    #[tokio::test]
    async fn test_unknown_grid_is_not_found() {
        let registry = registry(DAY, Arc::new(MemoryStore::new()));
        assert_eq!(
            registry.resolve(GridId::new()).await.unwrap_err(),
            ErrorKind::NotFound
        );
        assert_eq!(
            registry.derive_reroll(GridId::new()).await.unwrap_err(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_upscale_copies_parent_fields() {
        let (registry, grid_id, parent) = registry_with_grid(DAY).await;
        let derived = registry.derive_upscale(grid_id, 2).await.unwrap();

        assert_eq!(derived.kind, JobKind::Upscale);
        assert_eq!(derived.params, parent.params);
        assert_eq!(derived.parent_id, Some(parent.id));
        assert_eq!(derived.selected_index, Some(2));
        assert_eq!(
            derived.source_image.as_deref(),
            Some(format!("generations/{}-2.png", parent.id).as_str())
        );
        assert_ne!(derived.id, parent.id);
    }

    #[tokio::test]
    async fn test_variation_is_linked_to_selected_candidate() {
        let (registry, grid_id, parent) = registry_with_grid(DAY).await;
        let derived = registry.derive_variation(grid_id, 0).await.unwrap();
        assert_eq!(derived.kind, JobKind::Variation);
        assert_eq!(derived.selected_index, Some(0));
        assert_eq!(derived.params.prompt, parent.params.prompt);
    }

    #[tokio::test]
    async fn test_out_of_range_index_is_invalid() {
        let (registry, grid_id, _) = registry_with_grid(DAY).await;
        assert_eq!(
            registry.derive_upscale(grid_id, 5).await.unwrap_err(),
            ErrorKind::InvalidIndex
        );
        assert_eq!(
            registry.derive_variation(grid_id, 4).await.unwrap_err(),
            ErrorKind::InvalidIndex
        );
        assert_eq!(
            registry.derive_upscale(grid_id, 300).await.unwrap_err(),
            ErrorKind::InvalidIndex
        );
    }

    #[tokio::test]
    async fn test_index_bound_follows_recorded_count() {
        let registry = registry(DAY, Arc::new(MemoryStore::new()));
        let job = succeeded_job("one-off");
        let grid_id = GridId::new();
        registry.record(grid_id, job.clone(), candidates(&job, 1)).await;

        assert!(registry.derive_upscale(grid_id, 0).await.is_ok());
        assert_eq!(
            registry.derive_upscale(grid_id, 1).await.unwrap_err(),
            ErrorKind::InvalidIndex
        );
    }

    #[tokio::test]
    async fn test_reroll_differs_only_in_seed() {
        let (registry, grid_id, parent) = registry_with_grid(DAY).await;
        let derived = registry.derive_reroll(grid_id).await.unwrap();

        assert_eq!(derived.kind, JobKind::Reroll);
        assert_ne!(derived.params.seed, parent.params.seed);
        let mut reseeded = derived.params.clone();
        reseeded.seed = parent.params.seed;
        assert_eq!(reseeded, parent.params);
        assert_eq!(derived.selected_index, None);
        assert_eq!(derived.source_image, None);
    }

    #[tokio::test]
    async fn test_expired_grid_is_not_found() {
        let (registry, grid_id, _) = registry_with_grid(Duration::ZERO).await;
        assert_eq!(
            registry.resolve(grid_id).await.unwrap_err(),
            ErrorKind::NotFound
        );
        assert_eq!(
            registry.derive_upscale(grid_id, 0).await.unwrap_err(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_eviction_leaves_derived_jobs_intact() {
        let (registry, grid_id, parent) = registry_with_grid(Duration::from_secs(60)).await;
        let derived = registry.derive_upscale(grid_id, 1).await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(120);
        assert_eq!(registry.evict_expired(later).await, 1);
        assert_eq!(registry.len(), 0);
        assert_eq!(
            registry.resolve(grid_id).await.unwrap_err(),
            ErrorKind::NotFound
        );

        // The derived job owns a full copy of what it needs.
        assert_eq!(derived.params.prompt, parent.params.prompt);
        assert!(derived.source_image.is_some());
    }

    #[tokio::test]
    async fn test_evicted_grid_is_not_reloaded_from_store() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(Duration::from_secs(60), store.clone());
        let job = succeeded_job("lanterns");
        let grid_id = GridId::new();
        registry.record(grid_id, job.clone(), candidates(&job, 4)).await;

        registry
            .evict_expired(Utc::now() + chrono::Duration::seconds(120))
            .await;
        assert!(store.load_grid(grid_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cache_miss_falls_back_to_store() {
        let store = Arc::new(MemoryStore::new());
        let job = succeeded_job("restart survivor");
        let grid_id = GridId::new();
        {
            let before_restart = registry(DAY, store.clone());
            before_restart
                .record(grid_id, job.clone(), candidates(&job, 4))
                .await;
        }

        let after_restart = registry(DAY, store);
        let record = after_restart.resolve(grid_id).await.unwrap();
        assert_eq!(record.job_id(), job.id);
        assert!(after_restart.derive_variation(grid_id, 3).await.is_ok());
    }

    #[tokio::test]
    async fn test_eviction_after_restart_clears_store_and_images() {
        let store = Arc::new(MemoryStore::new());
        let images = Arc::new(MemoryImageStore::new());
        let job = succeeded_job("persisted before restart");
        let mut stored = Vec::new();
        for i in 0..4u8 {
            let image_ref = images
                .put(StoredImage {
                    bytes: bytes::Bytes::from_static(b"png"),
                    mime_type: "image/png".to_string(),
                })
                .await
                .unwrap();
            stored.push(Candidate {
                index: i,
                image_ref,
                parent_job_id: job.id,
            });
        }

        let grid_id = GridId::new();
        GridRegistry::new(DAY, store.clone(), images.clone())
            .record(grid_id, job, stored)
            .await;
        assert_eq!(images.len(), 4);

        // A fresh process has nothing cached, only the persisted row.
        let restarted = GridRegistry::new(DAY, store.clone(), images.clone());
        let evicted = restarted
            .evict_expired(Utc::now() + chrono::Duration::days(30))
            .await;

        assert_eq!(evicted, 1);
        assert!(store.load_grid(grid_id).await.unwrap().is_none());
        assert_eq!(images.len(), 0);
    }

    #[tokio::test]
    async fn test_live_grids_survive_store_sweep() {
        let store = Arc::new(MemoryStore::new());
        let (short, long) = (GridId::new(), GridId::new());
        let job = succeeded_job("two lifetimes");
        registry(Duration::from_secs(60), store.clone())
            .record(short, job.clone(), candidates(&job, 4))
            .await;
        registry(DAY, store.clone())
            .record(long, job.clone(), candidates(&job, 4))
            .await;

        let restarted = registry(DAY, store.clone());
        let evicted = restarted
            .evict_expired(Utc::now() + chrono::Duration::seconds(120))
            .await;
        assert_eq!(evicted, 1);
        assert!(store.load_grid(short).await.unwrap().is_none());
        assert!(restarted.resolve(long).await.is_ok());
    }

    #[tokio::test]
    async fn test_lineage_walks_parent_chain() {
        let (registry, grid_id, parent) = registry_with_grid(DAY).await;
        let upscale = registry.derive_upscale(grid_id, 0).await.unwrap();
        let upscale_grid = GridId::new();
        registry
            .record(upscale_grid, upscale.clone(), candidates(&upscale, 1))
            .await;
        let variation = registry.derive_variation(upscale_grid, 0).await.unwrap();
        registry.archive(variation.clone());

        assert_eq!(
            registry.lineage(variation.id),
            vec![variation.id, upscale.id, parent.id]
        );
    }
}
