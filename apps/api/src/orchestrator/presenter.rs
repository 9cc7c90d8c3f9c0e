//! Presentation sinks for terminal job results.
//!
//! The engine never formats chat messages; it hands a structured event to
//! whatever renders grids and buttons.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{info, warn};

use crate::errors::ErrorKind;
use crate::models::{Candidate, GenerationJob, GridId, JobId, JobKind, JobStatus, UserId};

const GENERIC_FAILURE: &str = "Generation failed, please try again";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TerminalEvent {
    pub job_id: JobId,
    pub user_id: UserId,
    pub kind: JobKind,
    pub parent_id: Option<JobId>,
    pub status: JobStatus,
    pub grid_id: Option<GridId>,
    pub candidates: Vec<Candidate>,
    pub error: Option<ErrorKind>,
    /// Whether offering "try again" makes sense.
    pub retryable: bool,
    /// Text safe to show the user. Internal failures get a generic line.
    pub message: Option<String>,
}

impl TerminalEvent {
    pub fn succeeded(job: &GenerationJob, grid_id: GridId, candidates: Vec<Candidate>) -> Self {
        Self {
            job_id: job.id,
            user_id: job.user_id,
            kind: job.kind,
            parent_id: job.parent_id,
            status: job.status,
            grid_id: Some(grid_id),
            candidates,
            error: None,
            retryable: false,
            message: None,
        }
    }

    pub fn failed(job: &GenerationJob) -> Self {
        let message = job.error.map(|kind| {
            if kind.is_user_facing() {
                kind.to_string()
            } else {
                GENERIC_FAILURE.to_string()
            }
        });
        Self {
            job_id: job.id,
            user_id: job.user_id,
            kind: job.kind,
            parent_id: job.parent_id,
            status: job.status,
            grid_id: None,
            candidates: Vec::new(),
            error: job.error,
            retryable: job.error.is_some_and(|kind| kind.is_retryable()),
            message,
        }
    }
}

#[async_trait]
pub trait Presenter: Send + Sync {
    async fn present(&self, event: &TerminalEvent) -> Result<()>;
}

/// Writes outcomes to the log. Used when no webhook is configured.
pub struct LogPresenter;

#[async_trait]
impl Presenter for LogPresenter {
    async fn present(&self, event: &TerminalEvent) -> Result<()> {
        match (event.grid_id, event.error) {
            (Some(grid_id), _) => info!(
                job_id = %event.job_id,
                user_id = %event.user_id,
                "Grid {grid_id} ready with {} candidate(s)",
                event.candidates.len()
            ),
            (None, error) => info!(
                job_id = %event.job_id,
                user_id = %event.user_id,
                "Job ended {:?}: {}",
                error,
                event.message.as_deref().unwrap_or("")
            ),
        }
        Ok(())
    }
}

/// POSTs each event as JSON to the presentation service.
pub struct WebhookPresenter {
    http: Client,
    url: String,
}

impl WebhookPresenter {
    pub fn new(url: String) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { http, url })
    }
}

#[async_trait]
impl Presenter for WebhookPresenter {
    async fn present(&self, event: &TerminalEvent) -> Result<()> {
        let response = self
            .http
            .post(&self.url)
            .json(event)
            .send()
            .await
            .with_context(|| format!("posting job {} to presentation webhook", event.job_id))?;

        if let Err(e) = response.error_for_status_ref() {
            warn!("Presentation webhook rejected job {}: {e}", event.job_id);
            return Err(e.into());
        }
        Ok(())
    }
}

/// Forwards events into a channel so tests can await them.
#[cfg(test)]
pub struct ChannelPresenter {
    tx: tokio::sync::mpsc::UnboundedSender<TerminalEvent>,
}

#[cfg(test)]
impl ChannelPresenter {
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<TerminalEvent>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[cfg(test)]
#[async_trait]
impl Presenter for ChannelPresenter {
    async fn present(&self, event: &TerminalEvent) -> Result<()> {
        self.tx
            .send(event.clone())
            .map_err(|_| anyhow::anyhow!("event receiver dropped"))
    }
}
