use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::ErrorKind;
use crate::models::{GenerationJob, JobId, JobKind, JobStatus, UserId};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("job {0} is not tracked")]
    UnknownJob(JobId),

    #[error("job {id} cannot move from {from:?} to {to:?}")]
    Illegal {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("job {0} was cancelled while queued")]
    Cancelled(JobId),
}

/// Point-in-time view of a job, served to status lookups.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub job_id: JobId,
    pub user_id: UserId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub error: Option<ErrorKind>,
    pub updated_at: DateTime<Utc>,
}

impl From<&GenerationJob> for JobView {
    fn from(job: &GenerationJob) -> Self {
        Self {
            job_id: job.id,
            user_id: job.user_id,
            kind: job.kind,
            status: job.status,
            error: job.error,
            updated_at: job.finished_at.unwrap_or(job.submitted_at),
        }
    }
}

struct JobEntry {
    user_id: UserId,
    kind: JobKind,
    status: watch::Sender<JobStatus>,
    error: Option<ErrorKind>,
    cancel: CancellationToken,
    updated_at: DateTime<Utc>,
}

/// Status of every live and recently finished job.
///
/// The only place job status changes, and it only ever moves forward.
#[derive(Default)]
pub struct JobBoard {
    jobs: RwLock<HashMap<JobId, JobEntry>>,
}

impl JobBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking a job in `Queued`. Returns its status feed and the
    /// token that expires it while queued.
    pub fn register(
        &self,
        job_id: JobId,
        user_id: UserId,
        kind: JobKind,
    ) -> (watch::Receiver<JobStatus>, CancellationToken) {
        let (tx, rx) = watch::channel(JobStatus::Queued);
        let cancel = CancellationToken::new();
        self.jobs.write().insert(
            job_id,
            JobEntry {
                user_id,
                kind,
                status: tx,
                error: None,
                cancel: cancel.clone(),
                updated_at: Utc::now(),
            },
        );
        (rx, cancel)
    }

    /// Drops a job that was registered but never accepted by the queue.
    pub fn forget(&self, job_id: JobId) {
        self.jobs.write().remove(&job_id);
    }

    /// Moves a job forward and returns when it happened.
    ///
    /// A cancelled job can no longer start: `cancel` and this check share the
    /// board lock, so a cancellation reported to the caller always wins over
    /// a dispatch that has not happened yet.
    pub fn transition(
        &self,
        job_id: JobId,
        next: JobStatus,
        error: Option<ErrorKind>,
    ) -> Result<DateTime<Utc>, TransitionError> {
        let mut jobs = self.jobs.write();
        let entry = jobs
            .get_mut(&job_id)
            .ok_or(TransitionError::UnknownJob(job_id))?;

        let current = *entry.status.borrow();
        if !current.can_transition_to(next) {
            return Err(TransitionError::Illegal {
                id: job_id,
                from: current,
                to: next,
            });
        }
        if next == JobStatus::Dispatching && entry.cancel.is_cancelled() {
            return Err(TransitionError::Cancelled(job_id));
        }

        let now = Utc::now();
        entry.error = error;
        entry.updated_at = now;
        entry.status.send_replace(next);
        debug!("Job {job_id}: {current:?} -> {next:?}");
        Ok(now)
    }

    pub fn view(&self, job_id: JobId) -> Option<JobView> {
        self.jobs.read().get(&job_id).map(|e| JobView {
            job_id,
            user_id: e.user_id,
            kind: e.kind,
            status: *e.status.borrow(),
            error: e.error,
            updated_at: e.updated_at,
        })
    }

    /// Signals the dispatch loop to expire a job that has not started.
    /// Returns `false` if the job is unknown or already past `Queued`.
    pub fn cancel(&self, job_id: JobId) -> bool {
        let jobs = self.jobs.read();
        match jobs.get(&job_id) {
            Some(entry) if *entry.status.borrow() == JobStatus::Queued => {
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Forgets terminal jobs last updated before `cutoff`.
    pub fn prune(&self, cutoff: DateTime<Utc>) -> usize {
        let mut jobs = self.jobs.write();
        let before = jobs.len();
        jobs.retain(|_, e| !(e.status.borrow().is_terminal() && e.updated_at < cutoff));
        before - jobs.len()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_board_enforces_forward_transitions() {
        let board = JobBoard::new();
        let id = JobId::new();
        board.register(id, UserId(1), JobKind::Original);

        board.transition(id, JobStatus::Dispatching, None).unwrap();
        assert_eq!(
            board.transition(id, JobStatus::Queued, None),
            Err(TransitionError::Illegal {
                id,
                from: JobStatus::Dispatching,
                to: JobStatus::Queued
            })
        );
        board
            .transition(id, JobStatus::Failed, Some(ErrorKind::Timeout))
            .unwrap();

        let view = board.view(id).unwrap();
        assert_eq!(view.status, JobStatus::Failed);
        assert_eq!(view.error, Some(ErrorKind::Timeout));
    }

    #[test]
    fn test_unknown_job_is_rejected() {
        let board = JobBoard::new();
        let id = JobId::new();
        assert_eq!(
            board.transition(id, JobStatus::Dispatching, None),
            Err(TransitionError::UnknownJob(id))
        );
    }

    #[test]
    fn test_cancel_only_applies_to_queued_jobs() {
        let board = JobBoard::new();
        let queued = JobId::new();
        let running = JobId::new();
        let (_, queued_token) = board.register(queued, UserId(1), JobKind::Original);
        let (_, running_token) = board.register(running, UserId(1), JobKind::Original);
        board.transition(running, JobStatus::Dispatching, None).unwrap();

        assert!(board.cancel(queued));
        assert!(queued_token.is_cancelled());
        assert!(!board.cancel(running));
        assert!(!running_token.is_cancelled());
    }

    #[test]
    fn test_cancelled_job_cannot_start_dispatching() {
        let board = JobBoard::new();
        let id = JobId::new();
        board.register(id, UserId(1), JobKind::Original);

        assert!(board.cancel(id));
        assert_eq!(
            board.transition(id, JobStatus::Dispatching, None),
            Err(TransitionError::Cancelled(id))
        );
        assert_eq!(board.view(id).unwrap().status, JobStatus::Queued);
        board
            .transition(id, JobStatus::Expired, Some(ErrorKind::Expired))
            .unwrap();
        assert_eq!(board.view(id).unwrap().status, JobStatus::Expired);
    }

    #[test]
    fn test_archived_view_reports_finish_time() {
        let mut job = GenerationJob::original(UserId(5), crate::models::GenerationParams::new("dunes"));
        let finished = job.submitted_at + chrono::Duration::seconds(42);
        job.status = JobStatus::Succeeded;
        job.finished_at = Some(finished);
        assert_eq!(JobView::from(&job).updated_at, finished);

        job.finished_at = None;
        assert_eq!(JobView::from(&job).updated_at, job.submitted_at);
    }

    #[test]
    fn test_watchers_see_transitions() {
        let board = JobBoard::new();
        let id = JobId::new();
        let (rx, _) = board.register(id, UserId(1), JobKind::Reroll);
        board.transition(id, JobStatus::Expired, Some(ErrorKind::Expired)).unwrap();
        assert_eq!(*rx.borrow(), JobStatus::Expired);
    }

    #[test]
    fn test_prune_keeps_live_jobs() {
        let board = JobBoard::new();
        let live = JobId::new();
        let done = JobId::new();
        board.register(live, UserId(1), JobKind::Original);
        board.register(done, UserId(1), JobKind::Original);
        board.transition(done, JobStatus::Expired, Some(ErrorKind::Expired)).unwrap();

        let removed = board.prune(Utc::now() + chrono::Duration::seconds(1));
        assert_eq!(removed, 1);
        assert!(board.view(live).is_some());
        assert!(board.view(done).is_none());
    }
}
