use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{GenerationJob, GridId, JobId};

/// Largest grid the presentation layer renders (2x2).
pub const MAX_CANDIDATES: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    /// 0 = top-left, 1 = top-right, 2 = bottom-left, 3 = bottom-right.
    pub index: u8,
    /// Opaque image reference (image-store key or URL).
    pub image_ref: String,
    pub parent_job_id: JobId,
}

/// One rendered grid. Never mutated; a re-roll produces a new record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridRecord {
    pub grid_id: GridId,
    /// Snapshot of the job that produced the grid.
    pub job: GenerationJob,
    pub candidates: Vec<Candidate>,
    pub created_at: DateTime<Utc>,
    /// After this instant the record is evictable and no longer resolves.
    pub expires_at: DateTime<Utc>,
}

impl GridRecord {
    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn candidate(&self, index: u8) -> Option<&Candidate> {
        self.candidates.iter().find(|c| c.index == index)
    }
}
