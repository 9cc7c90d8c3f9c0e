//! Generation client: the contract every image provider adapter implements.
//!
//! The dispatch loop is the only caller. It bounds each call with the
//! configured generation timeout, so adapters never need their own overall
//! deadline.

use async_trait::async_trait;
use thiserror::Error;

use crate::errors::ErrorKind;
use crate::models::{
    AspectRatio, Candidate, GenerationJob, JobId, JobKind, Quality, ReferenceImage, Style,
};

/// Everything an adapter needs to render one job.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub job_id: JobId,
    pub kind: JobKind,
    pub prompt: String,
    pub style: Style,
    pub quality: Quality,
    pub aspect_ratio: AspectRatio,
    pub references: Vec<ReferenceImage>,
    /// Overrides the adapter's configured model.
    pub model: Option<String>,
    pub seed: u32,
    /// Image-store reference of the candidate being upscaled or varied.
    pub source_image: Option<String>,
    pub candidate_count: usize,
}

impl GenerationRequest {
    pub fn from_job(job: &GenerationJob) -> Self {
        Self {
            job_id: job.id,
            kind: job.kind,
            prompt: job.params.prompt.clone(),
            style: job.params.style,
            quality: job.params.quality,
            aspect_ratio: job.params.aspect_ratio,
            references: job.params.references.clone(),
            model: job.params.model.clone(),
            seed: job.params.seed,
            source_image: job.source_image.clone(),
            candidate_count: job.kind.candidate_count(),
        }
    }
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("blocked by safety filter: {0}")]
    SafetyBlocked(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("upstream timed out")]
    Timeout,
}

impl GenerationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GenerationError::SafetyBlocked(_) => ErrorKind::SafetyBlocked,
            GenerationError::Upstream(_) => ErrorKind::UpstreamError,
            GenerationError::Timeout => ErrorKind::Timeout,
        }
    }
}

/// Image provider seam. Swap backends without touching the queue or the
/// orchestrator.
///
/// Returns up to `request.candidate_count` candidates, indexed from 0.
///
/// The dispatch loop spends one admission token before calling `generate`.
/// Adapters that send more than one provider request per job take a token
/// for each further request, retries included.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    async fn generate(&self, request: &GenerationRequest)
        -> Result<Vec<Candidate>, GenerationError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GenerationParams, UserId};

    #[test]
    fn test_request_copies_job_parameters() {
        let mut params = GenerationParams::new("misty harbour");
        params.style = Style::Watercolor;
        params.quality = Quality::TwoK;
        let job = GenerationJob::original(UserId(1), params.clone());

        let request = GenerationRequest::from_job(&job);
        assert_eq!(request.job_id, job.id);
        assert_eq!(request.prompt, "misty harbour");
        assert_eq!(request.style, Style::Watercolor);
        assert_eq!(request.quality, Quality::TwoK);
        assert_eq!(request.seed, params.seed);
        assert_eq!(request.candidate_count, 4);
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            GenerationError::SafetyBlocked("x".into()).kind(),
            ErrorKind::SafetyBlocked
        );
        assert_eq!(
            GenerationError::Upstream("x".into()).kind(),
            ErrorKind::UpstreamError
        );
        assert_eq!(GenerationError::Timeout.kind(), ErrorKind::Timeout);
    }
}
