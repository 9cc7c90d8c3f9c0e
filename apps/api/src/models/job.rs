use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ErrorKind;
use crate::models::{GenerationParams, JobId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Original,
    Upscale,
    Variation,
    Reroll,
}

impl JobKind {
    /// Upscale and variation act on one selected candidate.
    pub fn needs_candidate(self) -> bool {
        matches!(self, JobKind::Upscale | JobKind::Variation)
    }

    /// How many candidates the provider is asked for.
    pub fn candidate_count(self) -> usize {
        match self {
            JobKind::Upscale => 1,
            JobKind::Original | JobKind::Variation | JobKind::Reroll => 4,
        }
    }
}

/// Job lifecycle.
///
/// ```text
/// Queued ─► Dispatching ─► Succeeded | Failed
///   └─────► Expired
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Dispatching,
    Succeeded,
    Failed,
    Expired,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Expired
        )
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Dispatching)
                | (JobStatus::Queued, JobStatus::Expired)
                | (JobStatus::Dispatching, JobStatus::Succeeded)
                | (JobStatus::Dispatching, JobStatus::Failed)
        )
    }
}

/// One generation request. Immutable after creation apart from `status`,
/// `error` and `finished_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationJob {
    pub id: JobId,
    pub user_id: UserId,
    pub params: GenerationParams,
    pub kind: JobKind,
    pub parent_id: Option<JobId>,
    pub selected_index: Option<u8>,
    /// Image-store reference of the selected candidate (upscale/variation).
    pub source_image: Option<String>,
    pub status: JobStatus,
    pub error: Option<ErrorKind>,
    pub submitted_at: DateTime<Utc>,
    /// Set when the job reaches a terminal state.
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl GenerationJob {
    pub fn original(user_id: UserId, params: GenerationParams) -> Self {
        Self {
            id: JobId::new(),
            user_id,
            params,
            kind: JobKind::Original,
            parent_id: None,
            selected_index: None,
            source_image: None,
            status: JobStatus::Queued,
            error: None,
            submitted_at: Utc::now(),
            finished_at: None,
        }
    }

    /// A follow-up job linked to `parent`, carrying the given parameters.
    pub fn derived(
        parent: &GenerationJob,
        kind: JobKind,
        params: GenerationParams,
        selected: Option<(u8, String)>,
    ) -> Self {
        let (selected_index, source_image) = match selected {
            Some((index, image)) => (Some(index), Some(image)),
            None => (None, None),
        };
        Self {
            id: JobId::new(),
            user_id: parent.user_id,
            params,
            kind,
            parent_id: Some(parent.id),
            selected_index,
            source_image,
            status: JobStatus::Queued,
            error: None,
            submitted_at: Utc::now(),
            finished_at: None,
        }
    }
}
