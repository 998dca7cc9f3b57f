//! The transcoding pipeline.
//!
//! [`Orchestrator`] owns the admission queue and drives each job through
//! `metadata -> transcoding -> cleanup -> ready`. External tools live in
//! [`processors`]; all stage writes go through the [`progress`] aggregator.

pub mod admission;
pub mod orchestrator;
pub mod processors;
pub mod progress;
pub mod resource;
pub mod retry;

pub use admission::{AdmissionQueue, AdmissionStats, QueuedJob};
pub use orchestrator::{Orchestrator, PipelineStats, ShutdownReport};
pub use processors::{FfmpegToolkit, MediaToolkit};
pub use progress::{ProgressHandle, spawn_progress_aggregator};
pub use resource::{CapacityProbe, CapacityStatus, FixedCapacity, ResourceGuard, SystemProbe};
pub use retry::retry_stage;
