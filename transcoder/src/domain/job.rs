//! Transcoding job record and its state machine.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse job outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Processing,
    Ready,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fine-grained processing stage.
///
/// Stages advance strictly in declaration order; `Failed` is reachable from
/// every non-terminal stage. `Ready` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStage {
    Initializing,
    Metadata,
    Transcoding,
    Cleanup,
    Ready,
    Failed,
}

impl JobStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Metadata => "metadata",
            Self::Transcoding => "transcoding",
            Self::Cleanup => "cleanup",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }

    /// Persisted progress checkpoint reached when entering this stage.
    ///
    /// `Failed` has none: progress freezes where it was.
    pub fn checkpoint(&self) -> Option<u8> {
        match self {
            Self::Initializing | Self::Metadata => Some(0),
            Self::Transcoding => Some(10),
            Self::Cleanup => Some(90),
            Self::Ready => Some(100),
            Self::Failed => None,
        }
    }

    /// The stage that follows this one on the success path.
    pub fn next(&self) -> Option<JobStage> {
        match self {
            Self::Initializing => Some(Self::Metadata),
            Self::Metadata => Some(Self::Transcoding),
            Self::Transcoding => Some(Self::Cleanup),
            Self::Cleanup => Some(Self::Ready),
            Self::Ready | Self::Failed => None,
        }
    }

    /// Whether moving from `self` to `to` is a legal transition.
    ///
    /// Re-entering the current non-terminal stage is allowed so that a
    /// retried stage can republish itself.
    pub fn can_transition_to(&self, to: JobStage) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == Self::Failed || to == *self || self.next() == Some(to)
    }

    /// Coarse status implied by the stage.
    pub fn status(&self) -> JobStatus {
        match self {
            Self::Ready => JobStatus::Ready,
            Self::Failed => JobStatus::Failed,
            _ => JobStatus::Processing,
        }
    }
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frame size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Width of a frame scaled to `height` with the same aspect ratio,
    /// rounded to an even number as `scale=-2:h` does.
    ///
    /// Saturates at the largest even `u32` for extreme aspect ratios.
    pub fn scaled_width(&self, height: u32) -> u32 {
        if self.height == 0 || self.width == 0 {
            return 0;
        }
        let exact = self.width as f64 * height as f64 / self.height as f64;
        let half = (exact / 2.0).round().min((u32::MAX / 2) as f64) as u32;
        (half * 2).max(2)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// One transcoding unit of work for an uploaded source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub source_path: PathBuf,
    pub status: JobStatus,
    pub stage: JobStage,
    pub progress: u8,
    #[serde(default)]
    pub renditions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hls_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// A freshly uploaded job in `processing` / `initializing`.
    pub fn new(id: impl Into<String>, source_path: impl Into<PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            source_path: source_path.into(),
            status: JobStatus::Processing,
            stage: JobStage::Initializing,
            progress: 0,
            renditions: Vec::new(),
            manifest_path: None,
            hls_url: None,
            thumbnail_path: None,
            thumbnail_url: None,
            duration: None,
            resolution: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    /// Validate and apply a partial update.
    ///
    /// Terminal jobs are immutable and stage changes must follow
    /// [`JobStage::can_transition_to`].
    pub fn try_apply(&mut self, update: JobUpdate) -> crate::Result<()> {
        if self.is_terminal() {
            let to = update.stage.unwrap_or(self.stage);
            return Err(crate::Error::InvalidStateTransition {
                from: self.stage.to_string(),
                to: to.to_string(),
            });
        }
        if let Some(to) = update.stage
            && !self.stage.can_transition_to(to)
        {
            return Err(crate::Error::InvalidStateTransition {
                from: self.stage.to_string(),
                to: to.to_string(),
            });
        }
        self.apply(update);
        Ok(())
    }

    /// Apply a partial update without validation. Progress never moves
    /// backwards.
    pub fn apply(&mut self, update: JobUpdate) {
        if let Some(stage) = update.stage {
            self.stage = stage;
            self.status = stage.status();
        }
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(progress) = update.progress {
            self.progress = self.progress.max(progress.min(100));
        }
        if let Some(renditions) = update.renditions {
            self.renditions = renditions;
        }
        if let Some(path) = update.manifest_path {
            self.manifest_path = Some(path);
        }
        if let Some(url) = update.hls_url {
            self.hls_url = Some(url);
        }
        if let Some(path) = update.thumbnail_path {
            self.thumbnail_path = Some(path);
        }
        if let Some(url) = update.thumbnail_url {
            self.thumbnail_url = Some(url);
        }
        if let Some(duration) = update.duration {
            self.duration = Some(duration);
        }
        if let Some(resolution) = update.resolution {
            self.resolution = Some(resolution);
        }
        if let Some(error) = update.error {
            self.error = Some(error);
        }
        self.updated_at = Utc::now();
    }
}

/// Partial update applied to a [`Job`] in one store call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub stage: Option<JobStage>,
    pub progress: Option<u8>,
    pub renditions: Option<Vec<String>>,
    pub manifest_path: Option<PathBuf>,
    pub hls_url: Option<String>,
    pub thumbnail_path: Option<PathBuf>,
    pub thumbnail_url: Option<String>,
    pub duration: Option<f64>,
    pub resolution: Option<Resolution>,
    pub error: Option<String>,
}

impl JobUpdate {
    /// Move to `stage`, setting its checkpoint progress in the same write.
    pub fn stage(stage: JobStage) -> Self {
        Self {
            status: Some(stage.status()),
            stage: Some(stage),
            progress: stage.checkpoint(),
            ..Default::default()
        }
    }

    /// Terminal failure with the given message. Progress is left untouched.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::stage(JobStage::Failed)
        }
    }
}

/// Snapshot returned by status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingStatus {
    pub status: JobStatus,
    pub progress: u8,
    pub stage: JobStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&Job> for ProcessingStatus {
    fn from(job: &Job) -> Self {
        Self {
            status: job.status,
            progress: job.progress,
            stage: job.stage,
            error: job.error.clone(),
        }
    }
}
