//! Media toolkit trait and the types flowing through it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use process_utils::ProcessRegistry;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::domain::{QualityPreset, Resolution};

/// Callback receiving an encoder's percent complete (0.0-100.0).
pub type ProgressFn = Arc<dyn Fn(f64) + Send + Sync>;

/// Source properties reported by the prober.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoMetadata {
    /// Seconds. Zero when the container does not report one.
    pub duration: f64,
    pub resolution: Resolution,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
}

/// One rendition to encode.
#[derive(Debug, Clone)]
pub struct RenditionRequest {
    pub source: PathBuf,
    pub output_dir: PathBuf,
    pub preset: QualityPreset,
    pub metadata: VideoMetadata,
}

impl RenditionRequest {
    pub fn label(&self) -> String {
        self.preset.label()
    }

    /// `{output_dir}/{h}p.m3u8`
    pub fn playlist_name(&self) -> String {
        format!("{}.m3u8", self.label())
    }

    /// `{output_dir}/{h}p_%03d.ts`
    pub fn segment_pattern(&self) -> PathBuf {
        self.output_dir.join(format!("{}_%03d.ts", self.label()))
    }

    pub fn playlist_path(&self) -> PathBuf {
        self.output_dir.join(self.playlist_name())
    }
}

/// A successfully encoded rendition.
#[derive(Debug, Clone, PartialEq)]
pub struct RenditionOutput {
    pub label: String,
    pub resolution: Resolution,
    pub bitrate_kbps: u32,
    pub playlist_path: PathBuf,
}

impl RenditionOutput {
    /// Playlist file name, relative to the manifest.
    pub fn playlist_name(&self) -> String {
        self.playlist_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}.m3u8", self.label))
    }
}

/// Thumbnail to extract.
#[derive(Debug, Clone)]
pub struct ThumbnailRequest {
    pub source: PathBuf,
    pub output_path: PathBuf,
    pub width: u32,
    pub height: u32,
    /// Seek position in seconds.
    pub position_secs: f64,
    pub quality: u8,
}

/// Per-job handles every tool invocation needs.
#[derive(Clone)]
pub struct ToolContext {
    pub job_id: String,
    pub registry: Arc<ProcessRegistry<String>>,
    /// Global cap on concurrently running external processes.
    pub permits: Arc<Semaphore>,
    pub shutdown: CancellationToken,
    /// Wall-clock budget of each process.
    pub timeout: Duration,
}

impl ToolContext {
    /// Registry key of a task belonging to this job.
    pub fn process_key(&self, task: &str) -> String {
        format!("{}/{}", self.job_id, task)
    }
}

/// The external codec tool.
///
/// Every method runs at most one external process per call and is
/// responsible for registering it in `ctx.registry` while it runs.
#[async_trait]
pub trait MediaToolkit: Send + Sync {
    /// Check that the underlying tools can be run.
    async fn verify(&self) -> Result<()> {
        Ok(())
    }

    async fn probe(&self, ctx: &ToolContext, source: &Path) -> Result<VideoMetadata>;

    async fn encode_rendition(
        &self,
        ctx: &ToolContext,
        request: &RenditionRequest,
        on_progress: ProgressFn,
    ) -> Result<RenditionOutput>;

    async fn extract_thumbnail(
        &self,
        ctx: &ToolContext,
        request: &ThumbnailRequest,
    ) -> Result<PathBuf>;
}
