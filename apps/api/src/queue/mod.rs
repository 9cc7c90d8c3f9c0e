//! Job queue: one bounded FIFO of pending jobs drained by a single dispatch
//! loop.
//!
//! Submission is non-blocking: a full queue rejects immediately with
//! `QueueFull` instead of adding latency.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::errors::ErrorKind;
use crate::models::{GenerationJob, JobId, JobStatus};

pub mod board;
pub mod dispatcher;
pub mod handlers;

pub use board::{JobBoard, JobView};
pub use dispatcher::{Dispatcher, JobOutcome};

/// A job waiting in the queue.
pub struct QueuedJob {
    pub job: GenerationJob,
    /// After this instant the job expires instead of dispatching.
    pub deadline: Instant,
    pub cancel: CancellationToken,
    /// Held until the job leaves `Queued`.
    pub slot: QueueSlot,
}

/// One unit of queue capacity. Released on drop.
#[derive(Debug)]
pub struct QueueSlot(Arc<AtomicUsize>);

impl Drop for QueueSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Caller-side handle on an accepted job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub job_id: JobId,
    status: watch::Receiver<JobStatus>,
}

impl JobHandle {
    pub fn status(&self) -> JobStatus {
        *self.status.borrow()
    }

    /// Resolves once the job is Succeeded, Failed or Expired.
    #[cfg(test)]
    pub async fn wait_terminal(&mut self) -> JobStatus {
        let seen = self.status.wait_for(|s| s.is_terminal()).await.map(|s| *s);
        match seen {
            Ok(status) => status,
            // The board dropped the entry; report what we last saw.
            Err(_) => *self.status.borrow(),
        }
    }
}

/// Capacity counts every job still `Queued`, including the head the dispatch
/// loop has popped and is holding while it waits for admission.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<QueuedJob>,
    board: Arc<JobBoard>,
    max_residency: Duration,
    capacity: usize,
    queued: Arc<AtomicUsize>,
}

impl JobQueue {
    /// Creates the queue and the receiving end the dispatch loop drains.
    pub fn new(
        capacity: usize,
        max_residency: Duration,
        board: Arc<JobBoard>,
    ) -> (Self, mpsc::Receiver<QueuedJob>) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                board,
                max_residency,
                capacity,
                queued: Arc::new(AtomicUsize::new(0)),
            },
            rx,
        )
    }

    pub fn enqueue(&self, job: GenerationJob) -> Result<JobHandle, ErrorKind> {
        let job_id = job.id;
        let slot = self.claim_slot().ok_or_else(|| {
            info!("Queue full, rejected job {job_id}");
            ErrorKind::QueueFull
        })?;

        let (status, cancel) = self.board.register(job_id, job.user_id, job.kind);
        let queued = QueuedJob {
            job,
            deadline: Instant::now() + self.max_residency,
            cancel,
            slot,
        };

        match self.tx.try_send(queued) {
            Ok(()) => {
                debug!("Job {job_id} queued (depth {})", self.depth());
                Ok(JobHandle { job_id, status })
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.board.forget(job_id);
                info!("Queue full, rejected job {job_id}");
                Err(ErrorKind::QueueFull)
            }
            // Dispatch loop is gone (shutdown): nothing will ever run this job.
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.board.forget(job_id);
                info!("Queue closed, rejected job {job_id}");
                Err(ErrorKind::QueueFull)
            }
        }
    }

    fn claim_slot(&self) -> Option<QueueSlot> {
        self.queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .ok()
            .map(|_| QueueSlot(self.queued.clone()))
    }

    /// Jobs still `Queued`, including one the dispatcher holds for admission.
    pub fn depth(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn board(&self) -> &Arc<JobBoard> {
        &self.board
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GenerationParams, UserId};

    fn job(user: u64) -> GenerationJob {
        GenerationJob::original(UserId(user), GenerationParams::new("a lighthouse"))
    }

    #[tokio::test]
    async fn test_full_queue_rejects_immediately() {
        let board = Arc::new(JobBoard::new());
        let (queue, _rx) = JobQueue::new(2, Duration::from_secs(60), board.clone());

        queue.enqueue(job(1)).unwrap();
        queue.enqueue(job(2)).unwrap();
        let rejected = job(3);
        let rejected_id = rejected.id;
        assert_eq!(queue.enqueue(rejected).unwrap_err(), ErrorKind::QueueFull);

        assert_eq!(queue.depth(), 2);
        // Rejected jobs leave no trace on the board.
        assert!(board.view(rejected_id).is_none());
    }

    #[tokio::test]
    async fn test_queue_preserves_submission_order() {
        let board = Arc::new(JobBoard::new());
        let (queue, mut rx) = JobQueue::new(8, Duration::from_secs(60), board);

        let ids: Vec<JobId> = (0..5)
            .map(|u| queue.enqueue(job(u)).unwrap().job_id)
            .collect();

        let mut popped = Vec::new();
        for _ in 0..5 {
            popped.push(rx.recv().await.unwrap().job.id);
        }
        assert_eq!(popped, ids);
    }

    #[tokio::test]
    async fn test_popped_job_holds_its_slot_until_released() {
        let board = Arc::new(JobBoard::new());
        let (queue, mut rx) = JobQueue::new(1, Duration::from_secs(60), board);

        queue.enqueue(job(1)).unwrap();
        // Popped but still waiting for admission: the queue stays full.
        let head = rx.recv().await.unwrap();
        assert_eq!(queue.depth(), 1);
        assert_eq!(queue.enqueue(job(2)).unwrap_err(), ErrorKind::QueueFull);

        drop(head.slot);
        assert_eq!(queue.depth(), 0);
        assert!(queue.enqueue(job(3)).is_ok());
    }

    #[tokio::test]
    async fn test_closed_queue_rejects() {
        let board = Arc::new(JobBoard::new());
        let (queue, rx) = JobQueue::new(2, Duration::from_secs(60), board);
        drop(rx);
        assert_eq!(queue.enqueue(job(1)).unwrap_err(), ErrorKind::QueueFull);
    }

    #[tokio::test]
    async fn test_handle_starts_queued() {
        let board = Arc::new(JobBoard::new());
        let (queue, _rx) = JobQueue::new(2, Duration::from_secs(60), board);
        let handle = queue.enqueue(job(1)).unwrap();
        assert_eq!(handle.status(), JobStatus::Queued);
    }
}
