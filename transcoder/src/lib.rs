//! Adaptive-bitrate HLS transcoding pipeline.
//!
//! Uploaded videos are probed, encoded into a ladder of HLS renditions with
//! a thumbnail, and published behind a master playlist. Progress is pushed
//! to a [`broadcast::Broadcaster`] while job records live in a
//! [`store::JobStore`].

pub mod broadcast;
pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod store;

pub use broadcast::{Broadcaster, ChannelBroadcaster, PipelineEvent, ProgressDetails};
pub use config::PipelineConfig;
pub use domain::{Job, JobStage, JobStatus, ProcessingStatus};
pub use error::{Error, Result};
pub use pipeline::{Orchestrator, PipelineStats, ShutdownReport};
pub use store::{JobStore, MemoryJobStore};
