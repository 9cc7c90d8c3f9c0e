//! The single dispatch loop.
//!
//! Pops the queue head, waits for an admission token while the job is still
//! `Queued`, then moves it to `Dispatching` and calls the provider. Because
//! there is exactly one loop, at most one provider call is in flight.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::admission::AdmissionController;
use crate::errors::ErrorKind;
use crate::generation::client::{GenerationClient, GenerationRequest};
use crate::models::grid::MAX_CANDIDATES;
use crate::models::{Candidate, GenerationJob, JobStatus};
use crate::queue::board::TransitionError;
use crate::queue::{JobBoard, QueuedJob};

/// A job that reached a terminal state, handed to the orchestrator.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    /// Final snapshot; `status` is terminal and `error` is set unless it succeeded.
    pub job: GenerationJob,
    pub candidates: Vec<Candidate>,
}

pub struct Dispatcher {
    admission: Arc<AdmissionController>,
    client: Arc<dyn GenerationClient>,
    board: Arc<JobBoard>,
    generation_timeout: Duration,
    outcomes: mpsc::UnboundedSender<JobOutcome>,
}

impl Dispatcher {
    pub fn new(
        admission: Arc<AdmissionController>,
        client: Arc<dyn GenerationClient>,
        board: Arc<JobBoard>,
        generation_timeout: Duration,
        outcomes: mpsc::UnboundedSender<JobOutcome>,
    ) -> Self {
        Self {
            admission,
            client,
            board,
            generation_timeout,
            outcomes,
        }
    }

    /// Runs until `shutdown` fires or every queue sender is dropped. Jobs still
    /// queued at shutdown are expired so their quota is released.
    pub async fn run(self, mut rx: mpsc::Receiver<QueuedJob>, shutdown: CancellationToken) {
        info!("Dispatch loop started");

        loop {
            let queued = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = rx.recv() => match next {
                    Some(queued) => queued,
                    None => break,
                },
            };
            self.dispatch(queued, &shutdown).await;
        }

        rx.close();
        while let Some(queued) = rx.recv().await {
            self.expire(queued.job);
        }
        info!("Dispatch loop stopped");
    }

    async fn dispatch(&self, queued: QueuedJob, shutdown: &CancellationToken) {
        let QueuedJob {
            mut job,
            deadline,
            cancel,
            slot,
        } = queued;

        if cancel.is_cancelled() || Instant::now() >= deadline {
            return self.expire(job);
        }

        let popped_at = Instant::now();
        let admitted = tokio::select! {
            _ = cancel.cancelled() => None,
            _ = shutdown.cancelled() => None,
            token = self.admission.try_acquire(deadline) => token.ok(),
        };
        let Some(token) = admitted else {
            return self.expire(job);
        };
        debug!(
            "Job {} admitted after {:?}",
            job.id,
            token.granted_at.saturating_duration_since(popped_at)
        );

        match self.board.transition(job.id, JobStatus::Dispatching, None) {
            Ok(_) => {}
            Err(TransitionError::Cancelled(_)) => return self.expire(job),
            Err(e) => {
                error!("Job {} skipped: {e}", job.id);
                return;
            }
        }
        job.status = JobStatus::Dispatching;
        drop(slot);

        let request = GenerationRequest::from_job(&job);
        let started = Instant::now();
        let result = match timeout(self.generation_timeout, self.client.generate(&request)).await {
            Ok(Ok(candidates)) => accept_candidates(candidates),
            Ok(Err(e)) => {
                warn!("Job {} failed upstream: {e}", job.id);
                Err(e.kind())
            }
            Err(_) => {
                warn!(
                    "Job {} timed out after {:?}",
                    job.id, self.generation_timeout
                );
                Err(ErrorKind::Timeout)
            }
        };

        match result {
            Ok(candidates) => {
                debug!(
                    "Job {} produced {} candidates in {:?}",
                    job.id,
                    candidates.len(),
                    started.elapsed()
                );
                self.finish(job, JobStatus::Succeeded, None, candidates);
            }
            Err(kind) => self.finish(job, JobStatus::Failed, Some(kind), Vec::new()),
        }
    }

    fn expire(&self, job: GenerationJob) {
        info!("Job {} expired before dispatch", job.id);
        self.finish(job, JobStatus::Expired, Some(ErrorKind::Expired), Vec::new());
    }

    fn finish(
        &self,
        mut job: GenerationJob,
        status: JobStatus,
        error: Option<ErrorKind>,
        candidates: Vec<Candidate>,
    ) {
        let finished_at = match self.board.transition(job.id, status, error) {
            Ok(at) => at,
            Err(e) => {
                error!("Job {} could not finish: {e}", job.id);
                return;
            }
        };
        job.status = status;
        job.error = error;
        job.finished_at = Some(finished_at);

        if self.outcomes.send(JobOutcome { job, candidates }).is_err() {
            warn!("Outcome receiver dropped; terminal event lost");
        }
    }
}

/// Caps the grid at four and re-indexes in the order returned. An empty result
/// is an upstream failure.
fn accept_candidates(mut candidates: Vec<Candidate>) -> Result<Vec<Candidate>, ErrorKind> {
    if candidates.is_empty() {
        return Err(ErrorKind::UpstreamError);
    }
    candidates.truncate(MAX_CANDIDATES);
    for (i, candidate) in candidates.iter_mut().enumerate() {
        candidate.index = i as u8;
    }
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::client::GenerationError;
    use crate::models::{GenerationParams, JobId, UserId};
    use crate::queue::JobQueue;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Records every call and answers from a script.
    struct ScriptedClient {
        calls: Mutex<Vec<(JobId, Instant)>>,
        delay: Duration,
        fail_with: Option<fn() -> GenerationError>,
    }

    impl ScriptedClient {
        fn ok(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                delay,
                fail_with: None,
            })
        }

        fn failing(f: fn() -> GenerationError) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                delay: Duration::ZERO,
                fail_with: Some(f),
            })
        }
    }

    #[async_trait]
    impl GenerationClient for ScriptedClient {
        async fn generate(
            &self,
            request: &GenerationRequest,
        ) -> Result<Vec<Candidate>, GenerationError> {
            self.calls.lock().push((request.job_id, Instant::now()));
            tokio::time::sleep(self.delay).await;
            if let Some(f) = self.fail_with {
                return Err(f());
            }
            Ok((0..request.candidate_count)
                .map(|i| Candidate {
                    index: i as u8,
                    image_ref: format!("mem/{}/{i}", request.job_id),
                    parent_job_id: request.job_id,
                })
                .collect())
        }
    }

    struct Harness {
        queue: JobQueue,
        outcomes: mpsc::UnboundedReceiver<JobOutcome>,
        shutdown: CancellationToken,
    }

    fn harness(
        rpm: u32,
        residency: Duration,
        timeout: Duration,
        client: Arc<dyn GenerationClient>,
    ) -> Harness {
        let board = Arc::new(JobBoard::new());
        let (queue, rx) = JobQueue::new(16, residency, board.clone());
        let (tx, outcomes) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(
            Arc::new(AdmissionController::new(rpm)),
            client,
            board,
            timeout,
            tx,
        );
        let shutdown = CancellationToken::new();
        tokio::spawn(dispatcher.run(rx, shutdown.clone()));
        Harness {
            queue,
            outcomes,
            shutdown,
        }
    }

    fn job(user: u64) -> GenerationJob {
        GenerationJob::original(UserId(user), GenerationParams::new("a red kite"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_attaches_candidates() {
        let client = ScriptedClient::ok(Duration::from_secs(1));
        let mut h = harness(10, Duration::from_secs(600), Duration::from_secs(30), client);

        let mut handle = h.queue.enqueue(job(1)).unwrap();
        let outcome = h.outcomes.recv().await.unwrap();

        assert_eq!(outcome.job.status, JobStatus::Succeeded);
        assert_eq!(outcome.candidates.len(), 4);
        assert!(outcome.job.finished_at.is_some());
        assert_eq!(handle.wait_terminal().await, JobStatus::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_provider_times_out() {
        let client = ScriptedClient::ok(Duration::from_secs(300));
        let mut h = harness(10, Duration::from_secs(600), Duration::from_secs(30), client);

        h.queue.enqueue(job(1)).unwrap();
        let outcome = h.outcomes.recv().await.unwrap();

        assert_eq!(outcome.job.status, JobStatus::Failed);
        assert_eq!(outcome.job.error, Some(ErrorKind::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_safety_block_is_recorded_on_the_job() {
        let client = ScriptedClient::failing(|| GenerationError::SafetyBlocked("IMAGE_SAFETY".into()));
        let mut h = harness(10, Duration::from_secs(600), Duration::from_secs(30), client);

        h.queue.enqueue(job(1)).unwrap();
        let outcome = h.outcomes.recv().await.unwrap();

        assert_eq!(outcome.job.status, JobStatus::Failed);
        assert_eq!(outcome.job.error, Some(ErrorKind::SafetyBlocked));
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_expires_waiting_for_admission_without_calling_provider() {
        let client = ScriptedClient::ok(Duration::ZERO);
        // One call per minute, but jobs may only wait 10s.
        let mut h = harness(1, Duration::from_secs(10), Duration::from_secs(30), client.clone());

        let first = h.queue.enqueue(job(1)).unwrap();
        let second = h.queue.enqueue(job(2)).unwrap();

        let a = h.outcomes.recv().await.unwrap();
        let b = h.outcomes.recv().await.unwrap();
        assert_eq!(a.job.id, first.job_id);
        assert_eq!(a.job.status, JobStatus::Succeeded);
        assert_eq!(b.job.id, second.job_id);
        assert_eq!(b.job.status, JobStatus::Expired);
        assert_eq!(b.job.error, Some(ErrorKind::Expired));

        let calls = client.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, first.job_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_job_never_dispatches() {
        let client = ScriptedClient::ok(Duration::from_secs(5));
        let mut h = harness(1, Duration::from_secs(600), Duration::from_secs(30), client.clone());

        h.queue.enqueue(job(1)).unwrap();
        let waiting = h.queue.enqueue(job(2)).unwrap();
        assert!(h.queue.board().cancel(waiting.job_id));

        h.outcomes.recv().await.unwrap();
        let expired = h.outcomes.recv().await.unwrap();
        assert_eq!(expired.job.id, waiting.job_id);
        assert_eq!(expired.job.status, JobStatus::Expired);
        assert_eq!(client.calls.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_jobs_dispatch_in_order() {
        let client = ScriptedClient::ok(Duration::ZERO);
        let mut h = harness(1, Duration::from_secs(600), Duration::from_secs(30), client.clone());
        let start = Instant::now();

        let ids: Vec<JobId> = (0..3)
            .map(|u| h.queue.enqueue(job(u)).unwrap().job_id)
            .collect();
        for _ in 0..3 {
            h.outcomes.recv().await.unwrap();
        }

        let calls = client.calls.lock();
        let order: Vec<JobId> = calls.iter().map(|(id, _)| *id).collect();
        assert_eq!(order, ids);
        assert_eq!(calls[0].1 - start, Duration::ZERO);
        assert_eq!(calls[1].1 - start, Duration::from_secs(60));
        assert_eq!(calls[2].1 - start, Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_expires_remaining_jobs() {
        let client = ScriptedClient::ok(Duration::ZERO);
        let mut h = harness(1, Duration::from_secs(600), Duration::from_secs(30), client.clone());

        h.queue.enqueue(job(1)).unwrap();
        h.outcomes.recv().await.unwrap();
        h.queue.enqueue(job(2)).unwrap();
        h.queue.enqueue(job(3)).unwrap();
        h.shutdown.cancel();

        let a = h.outcomes.recv().await.unwrap();
        let b = h.outcomes.recv().await.unwrap();
        assert_eq!(a.job.status, JobStatus::Expired);
        assert_eq!(b.job.status, JobStatus::Expired);
        assert_eq!(client.calls.lock().len(), 1);
    }

    #[test]
    fn test_accept_candidates_caps_and_reindexes() {
        let parent = JobId::new();
        let candidates = (0..6)
            .map(|i| Candidate {
                index: 9 - i,
                image_ref: format!("ref-{i}"),
                parent_job_id: parent,
            })
            .collect();
        let accepted = accept_candidates(candidates).unwrap();
        assert_eq!(accepted.len(), 4);
        assert_eq!(
            accepted.iter().map(|c| c.index).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
        assert_eq!(accepted[0].image_ref, "ref-0");
    }

    #[test]
    fn test_accept_candidates_rejects_empty() {
        assert_eq!(accept_candidates(Vec::new()), Err(ErrorKind::UpstreamError));
    }
}
