pub mod grid;
pub mod ids;
pub mod job;
pub mod params;
pub mod profile;
pub mod quota;

pub use grid::{Candidate, GridRecord};
pub use ids::{GridId, JobId, UserId};
pub use job::{GenerationJob, JobKind, JobStatus};
pub use params::{AspectRatio, GenerationParams, Quality, ReferenceImage, Style};
pub use profile::{ReferenceSlot, SettingsUpdate, UserSettings, REFERENCE_SLOTS};
pub use quota::QuotaEntry;
