//! Domain types: jobs, presets and policies.

pub mod job;
pub mod preset;
pub mod retry_policy;

pub use job::{Job, JobStage, JobStatus, JobUpdate, ProcessingStatus, Resolution};
pub use preset::{QualityPreset, SpeedPreset};
pub use retry_policy::RetryPolicy;
