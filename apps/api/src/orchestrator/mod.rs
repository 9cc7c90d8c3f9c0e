//! Orchestrator: the façade every submission goes through.
//!
//! Submission path: validate → reserve quota → enqueue. Quota and queue
//! denials are answered synchronously and never reach the dispatch loop.
//! Terminal path: the dispatch loop reports outcomes over a channel and a
//! single consumer settles quota, records grids and notifies the presenter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admission::AdmissionController;
use crate::config::Config;
use crate::errors::ErrorKind;
use crate::generation::client::GenerationClient;
use crate::grid::GridRegistry;
use crate::models::{GenerationJob, GenerationParams, GridId, GridRecord, JobId, JobKind, JobStatus, UserId};
use crate::queue::{Dispatcher, JobBoard, JobHandle, JobOutcome, JobQueue, JobView};
use crate::quota::{QuotaLedger, QuotaUsage, Reservation};

pub mod presenter;


pub use presenter::{LogPresenter, Presenter, TerminalEvent, WebhookPresenter};

/// Queue and dispatch tuning taken from `Config`.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub queue_capacity: usize,
    pub queue_max_residency: Duration,
    pub generation_timeout: Duration,
    pub eviction_interval: Duration,
}

impl From<&Config> for EngineSettings {
    fn from(config: &Config) -> Self {
        Self {
            queue_capacity: config.queue_capacity,
            queue_max_residency: config.queue_max_residency,
            generation_timeout: config.generation_timeout,
            eviction_interval: config.eviction_interval,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub requests_in_window: usize,
    pub rate_limit_per_minute: usize,
    pub tracked_jobs: usize,
    pub live_grids: usize,
    pub daily_limit: u32,
}

pub struct Orchestrator {
    quota: Arc<QuotaLedger>,
    admission: Arc<AdmissionController>,
    queue: JobQueue,
    grids: Arc<GridRegistry>,
    presenter: Arc<dyn Presenter>,
    /// Reservations held by jobs that have not reached a terminal state.
    pending: Mutex<HashMap<JobId, Reservation>>,
}

impl Orchestrator {
    /// Builds the engine and spawns its background tasks: the dispatch loop,
    /// the terminal-outcome consumer and the eviction sweeper.
    ///
    /// All three stop after `shutdown` fires; jobs still queued at that point
    /// are expired and their quota released before the consumer exits.
    ///
    /// `admission` is shared with the generation client, which spends a
    /// token on every provider request beyond the first of a job.
    pub fn start(
        settings: EngineSettings,
        admission: Arc<AdmissionController>,
        quota: Arc<QuotaLedger>,
        grids: Arc<GridRegistry>,
        client: Arc<dyn GenerationClient>,
        presenter: Arc<dyn Presenter>,
        shutdown: CancellationToken,
    ) -> (Arc<Self>, Vec<JoinHandle<()>>) {
        let board = Arc::new(JobBoard::new());
        let (queue, queue_rx) = JobQueue::new(
            settings.queue_capacity,
            settings.queue_max_residency,
            board.clone(),
        );
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();

        let dispatcher = Dispatcher::new(
            admission.clone(),
            client,
            board,
            settings.generation_timeout,
            outcome_tx,
        );

        let orchestrator = Arc::new(Self {
            quota,
            admission,
            queue,
            grids,
            presenter,
            pending: Mutex::new(HashMap::new()),
        });

        let tasks = vec![
            tokio::spawn(dispatcher.run(queue_rx, shutdown.clone())),
            tokio::spawn(orchestrator.clone().consume_outcomes(outcome_rx)),
            tokio::spawn(
                orchestrator
                    .clone()
                    .sweep(settings.eviction_interval, shutdown),
            ),
        ];

        info!(
            "Engine started: {} req/min, queue capacity {}, residency {:?}",
            orchestrator.admission.capacity(),
            settings.queue_capacity,
            settings.queue_max_residency
        );
        (orchestrator, tasks)
    }

    // ─── Submission ──────────────────────────────────────────────────────────

    pub async fn submit_original(
        &self,
        user_id: UserId,
        params: GenerationParams,
    ) -> Result<JobHandle, ErrorKind> {
        if let Err(e) = params.validate() {
            info!("Rejected request from user {user_id}: {e}");
            return Err(ErrorKind::InvalidRequest);
        }
        self.admit(GenerationJob::original(user_id, params)).await
    }

    /// Follow-up action on a grid. `index` selects the candidate for upscale
    /// and variation and is ignored for re-roll.
    pub async fn submit_derived(
        &self,
        user_id: UserId,
        grid_id: GridId,
        kind: JobKind,
        index: Option<usize>,
    ) -> Result<JobHandle, ErrorKind> {
        let record = self.grids.resolve(grid_id).await?;
        if record.job.user_id != user_id {
            info!(
                "User {user_id} tried to act on grid {grid_id} owned by {}",
                record.job.user_id
            );
            return Err(ErrorKind::NotOwner);
        }

        let job = match (kind, index) {
            (JobKind::Upscale, Some(i)) => self.grids.derive_upscale(grid_id, i).await?,
            (JobKind::Variation, Some(i)) => self.grids.derive_variation(grid_id, i).await?,
            (JobKind::Reroll, _) => self.grids.derive_reroll(grid_id).await?,
            (k, None) if k.needs_candidate() => return Err(ErrorKind::InvalidIndex),
            _ => return Err(ErrorKind::InvalidRequest),
        };
        self.admit(job).await
    }

    /// Reserve, then enqueue; a queue rejection hands the reservation back.
    async fn admit(&self, job: GenerationJob) -> Result<JobHandle, ErrorKind> {
        let job_id = job.id;
        let user_id = job.user_id;
        let kind = job.kind;

        let reservation = self.quota.reserve_today(user_id).await?;
        // Registered before enqueue so a fast outcome always finds it.
        self.pending.lock().insert(job_id, reservation.clone());

        match self.queue.enqueue(job) {
            Ok(handle) => {
                info!("Accepted {kind:?} job {job_id} for user {user_id}");
                Ok(handle)
            }
            Err(kind) => {
                self.pending.lock().remove(&job_id);
                self.quota.release(&reservation);
                Err(kind)
            }
        }
    }

    /// Platform-side interaction window closed: expire a job that has not
    /// started. Its quota is released when the dispatch loop reports it.
    pub fn expire(&self, job_id: JobId) -> bool {
        let cancelled = self.queue.board().cancel(job_id);
        if cancelled {
            info!("Job {job_id} cancelled while queued");
        }
        cancelled
    }

    // ─── Terminal path ───────────────────────────────────────────────────────

    /// Settles quota for a finished job, records its grid on success and
    /// notifies the presenter.
    pub async fn on_job_terminal(&self, outcome: JobOutcome) {
        let JobOutcome { job, candidates } = outcome;
        let reservation = self.pending.lock().remove(&job.id);
        if reservation.is_none() {
            warn!("Job {} finished without a quota reservation", job.id);
        }

        let event = match job.status {
            JobStatus::Succeeded => {
                if let Some(reservation) = &reservation {
                    self.quota.commit(reservation).await;
                }
                let grid_id = GridId::new();
                let record = self.grids.record(grid_id, job, candidates).await;
                info!(
                    "Job {} succeeded: grid {grid_id} for user {}",
                    record.job_id(),
                    record.job.user_id
                );
                TerminalEvent::succeeded(&record.job, grid_id, record.candidates.clone())
            }
            JobStatus::Failed | JobStatus::Expired => {
                if let Some(reservation) = &reservation {
                    self.quota.release(reservation);
                }
                warn!(
                    "Job {} for user {} ended {:?} ({:?})",
                    job.id, job.user_id, job.status, job.error
                );
                let event = TerminalEvent::failed(&job);
                self.grids.archive(job);
                event
            }
            status => {
                warn!("Ignoring non-terminal outcome {status:?} for job {}", job.id);
                return;
            }
        };

        if let Err(e) = self.presenter.present(&event).await {
            warn!("Presenter failed for job {}: {e:#}", event.job_id);
        }
    }

    async fn consume_outcomes(self: Arc<Self>, mut outcomes: mpsc::UnboundedReceiver<JobOutcome>) {
        while let Some(outcome) = outcomes.recv().await {
            self.on_job_terminal(outcome).await;
        }
        debug!("Outcome consumer stopped");
    }

    async fn sweep(self: Arc<Self>, every: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let now = Utc::now();
                    self.grids.evict_expired(now).await;
                    self.quota.prune_idle();
                    let pruned = self.queue.board().prune(now - self.grids.retention());
                    if pruned > 0 {
                        debug!("Pruned {pruned} finished job(s) from the board");
                    }
                }
            }
        }
    }

    // ─── Queries ─────────────────────────────────────────────────────────────

    /// Live status from the board, falling back to the archive once the
    /// board has pruned the job.
    pub fn job(&self, job_id: JobId) -> Option<JobView> {
        self.queue
            .board()
            .view(job_id)
            .or_else(|| self.grids.job(job_id).as_ref().map(JobView::from))
    }

    pub async fn grid(&self, grid_id: GridId) -> Result<GridRecord, ErrorKind> {
        self.grids.resolve(grid_id).await
    }

    pub fn lineage(&self, job_id: JobId) -> Vec<JobId> {
        self.grids.lineage(job_id)
    }

    pub async fn usage(&self, user_id: UserId) -> QuotaUsage {
        self.quota.usage(user_id).await
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            queue_depth: self.queue.depth(),
            queue_capacity: self.queue.capacity(),
            requests_in_window: self.admission.requests_in_window(),
            rate_limit_per_minute: self.admission.capacity(),
            tracked_jobs: self.queue.board().len(),
            live_grids: self.grids.len(),
            daily_limit: self.quota.daily_limit(),
        }
    }
}
