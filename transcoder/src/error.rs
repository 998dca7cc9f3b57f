//! Application-wide error types.

use std::time::Duration;

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
///
/// The `Display` string of a variant is what ends up in a failed job's
/// persisted `error` field.
#[derive(Error, Debug)]
pub enum Error {
    /// ffprobe failed, produced unparseable output, or found no video stream.
    #[error("Probe failed: {0}")]
    Probe(String),

    /// ffmpeg exited with an error while encoding a rendition.
    #[error("Encode failed: {0}")]
    Encode(String),

    /// ffmpeg failed to extract the thumbnail frame.
    #[error("Thumbnail extraction failed: {0}")]
    Thumbnail(String),

    /// An external process exceeded its wall-clock budget and was killed.
    #[error("{task} timed out after {}s", after.as_secs())]
    Timeout { task: String, after: Duration },

    /// Admission was rejected because the host is under resource pressure.
    #[error("System resources not available: {0}")]
    ResourceExhausted(String),

    /// The pipeline is shutting down.
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn timeout(task: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            task: task.into(),
            after,
        }
    }

    /// Whether the job-level retry policy may re-attempt after this error.
    ///
    /// Shutdown, admission rejection and bookkeeping errors are final.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Cancelled(_)
                | Self::ResourceExhausted(_)
                | Self::NotFound { .. }
                | Self::InvalidStateTransition { .. }
                | Self::Configuration(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}
