//! Pipeline configuration.
//!
//! Defaults match a small single-host deployment. Every field can be
//! overridden from a JSON file and then from environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{QualityPreset, RetryPolicy};
use crate::{Error, Result};

/// Thumbnail extraction settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThumbnailConfig {
    #[serde(default = "default_thumbnail_width")]
    pub width: u32,
    #[serde(default = "default_thumbnail_height")]
    pub height: u32,
    /// Preferred seek position. Clamped to half the source duration.
    #[serde(default = "default_thumbnail_offset_secs")]
    pub offset_secs: f64,
    /// JPEG quality scale for `-q:v` (2-31, lower is better).
    #[serde(default = "default_thumbnail_quality")]
    pub quality: u8,
}

fn default_thumbnail_width() -> u32 {
    320
}

fn default_thumbnail_height() -> u32 {
    240
}

fn default_thumbnail_offset_secs() -> f64 {
    10.0
}

fn default_thumbnail_quality() -> u8 {
    2
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            width: default_thumbnail_width(),
            height: default_thumbnail_height(),
            offset_secs: default_thumbnail_offset_secs(),
            quality: default_thumbnail_quality(),
        }
    }
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
    #[serde(default = "default_hls_dir")]
    pub hls_dir: PathBuf,
    #[serde(default = "default_thumbnail_dir")]
    pub thumbnail_dir: PathBuf,

    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,

    /// Jobs processed at the same time.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// External tool processes running at the same time, across all jobs.
    #[serde(default = "default_max_tool_processes")]
    pub max_tool_processes: usize,

    #[serde(default)]
    pub retry: RetryPolicy,

    /// Wall-clock budget of a single external process.
    #[serde(default = "default_process_timeout_secs")]
    pub process_timeout_secs: u64,
    /// Grace period for in-flight jobs to unwind on shutdown.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Used/total memory ratio above which admission is refused.
    #[serde(default = "default_memory_threshold")]
    pub memory_threshold: f64,
    /// Minimum free bytes on the HLS output volume. Disabled when `None`.
    #[serde(default)]
    pub min_free_disk_bytes: Option<u64>,
    /// Delay before re-checking resources when queued work was held back
    /// and nothing is running to trigger the next dispatch.
    #[serde(default = "default_resource_retry_ms")]
    pub resource_retry_ms: u64,

    #[serde(default = "QualityPreset::default_ladder")]
    pub presets: Vec<QualityPreset>,
    #[serde(default = "default_segment_duration_secs")]
    pub segment_duration_secs: u32,
    #[serde(default = "default_keyframe_interval")]
    pub keyframe_interval: u32,
    #[serde(default = "default_audio_bitrate_kbps")]
    pub audio_bitrate_kbps: u32,

    #[serde(default)]
    pub thumbnail: ThumbnailConfig,

    /// File name of the master playlist inside each job's HLS directory.
    #[serde(default = "default_manifest_filename")]
    pub manifest_filename: String,
    /// Public URL prefix under which `hls_dir` is served.
    #[serde(default = "default_hls_url_prefix")]
    pub hls_url_prefix: String,
    /// Public URL prefix under which `thumbnail_dir` is served.
    #[serde(default = "default_thumbnail_url_prefix")]
    pub thumbnail_url_prefix: String,
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_hls_dir() -> PathBuf {
    PathBuf::from("public/hls")
}

fn default_thumbnail_dir() -> PathBuf {
    PathBuf::from("public/thumbnails")
}

fn default_ffmpeg_path() -> String {
    std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string())
}

fn default_ffprobe_path() -> String {
    std::env::var("FFPROBE_PATH").unwrap_or_else(|_| "ffprobe".to_string())
}

fn default_max_concurrent() -> usize {
    2
}

fn default_max_tool_processes() -> usize {
    8
}

fn default_process_timeout_secs() -> u64 {
    30 * 60
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

fn default_memory_threshold() -> f64 {
    0.9
}

fn default_resource_retry_ms() -> u64 {
    5000
}

fn default_segment_duration_secs() -> u32 {
    4
}

fn default_keyframe_interval() -> u32 {
    48
}

fn default_audio_bitrate_kbps() -> u32 {
    128
}

fn default_manifest_filename() -> String {
    "playlist.m3u8".to_string()
}

fn default_hls_url_prefix() -> String {
    "/hls".to_string()
}

fn default_thumbnail_url_prefix() -> String {
    "/thumbnails".to_string()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            upload_dir: default_upload_dir(),
            hls_dir: default_hls_dir(),
            thumbnail_dir: default_thumbnail_dir(),
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            max_concurrent: default_max_concurrent(),
            max_tool_processes: default_max_tool_processes(),
            retry: RetryPolicy::default(),
            process_timeout_secs: default_process_timeout_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            memory_threshold: default_memory_threshold(),
            min_free_disk_bytes: None,
            resource_retry_ms: default_resource_retry_ms(),
            presets: QualityPreset::default_ladder(),
            segment_duration_secs: default_segment_duration_secs(),
            keyframe_interval: default_keyframe_interval(),
            audio_bitrate_kbps: default_audio_bitrate_kbps(),
            thumbnail: ThumbnailConfig::default(),
            manifest_filename: default_manifest_filename(),
            hls_url_prefix: default_hls_url_prefix(),
            thumbnail_url_prefix: default_thumbnail_url_prefix(),
        }
    }
}

impl PipelineConfig {
    /// Load `.env`, start from defaults (or `TRANSCODER_CONFIG` if set) and
    /// apply environment overrides.
    ///
    /// Supported env vars:
    /// - `TRANSCODER_CONFIG` (path to a JSON config file)
    /// - `TRANSCODER_UPLOAD_DIR`, `TRANSCODER_HLS_DIR`, `TRANSCODER_THUMBNAIL_DIR`
    /// - `FFMPEG_PATH`, `FFPROBE_PATH`
    /// - `TRANSCODER_MAX_CONCURRENT`, `TRANSCODER_MAX_TOOL_PROCESSES`
    /// - `TRANSCODER_MAX_RETRIES`, `TRANSCODER_RETRY_DELAY_MS`
    /// - `TRANSCODER_PROCESS_TIMEOUT_SECS`
    /// - `TRANSCODER_MEMORY_THRESHOLD`, `TRANSCODER_MIN_FREE_DISK_BYTES`
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = match std::env::var("TRANSCODER_CONFIG") {
            Ok(path) if !path.trim().is_empty() => Self::from_file(Path::new(path.trim()))?,
            _ => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&content)?;
        debug!(path = %path.display(), "Loaded pipeline config file");
        Ok(config)
    }

    /// Apply overrides from a key lookup. Unparseable values are ignored.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(dir) = get("TRANSCODER_UPLOAD_DIR") {
            self.upload_dir = PathBuf::from(dir);
        }
        if let Some(dir) = get("TRANSCODER_HLS_DIR") {
            self.hls_dir = PathBuf::from(dir);
        }
        if let Some(dir) = get("TRANSCODER_THUMBNAIL_DIR") {
            self.thumbnail_dir = PathBuf::from(dir);
        }
        if let Some(path) = get("FFMPEG_PATH") {
            self.ffmpeg_path = path;
        }
        if let Some(path) = get("FFPROBE_PATH") {
            self.ffprobe_path = path;
        }
        if let Some(value) = get("TRANSCODER_MAX_CONCURRENT")
            && let Ok(parsed) = value.parse()
        {
            self.max_concurrent = parsed;
        }
        if let Some(value) = get("TRANSCODER_MAX_TOOL_PROCESSES")
            && let Ok(parsed) = value.parse()
        {
            self.max_tool_processes = parsed;
        }
        if let Some(value) = get("TRANSCODER_MAX_RETRIES")
            && let Ok(parsed) = value.parse()
        {
            self.retry.max_attempts = parsed;
        }
        if let Some(value) = get("TRANSCODER_RETRY_DELAY_MS")
            && let Ok(parsed) = value.parse()
        {
            self.retry.initial_delay_ms = parsed;
        }
        if let Some(value) = get("TRANSCODER_PROCESS_TIMEOUT_SECS")
            && let Ok(parsed) = value.parse()
        {
            self.process_timeout_secs = parsed;
        }
        if let Some(value) = get("TRANSCODER_MEMORY_THRESHOLD")
            && let Ok(parsed) = value.parse()
        {
            self.memory_threshold = parsed;
        }
        if let Some(value) = get("TRANSCODER_MIN_FREE_DISK_BYTES")
            && let Ok(parsed) = value.parse()
        {
            self.min_free_disk_bytes = Some(parsed);
        }
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(Error::config("max_concurrent must be at least 1"));
        }
        if self.max_tool_processes == 0 {
            return Err(Error::config("max_tool_processes must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::config("retry.max_attempts must be at least 1"));
        }
        if self.process_timeout_secs == 0 {
            return Err(Error::config("process_timeout_secs must be positive"));
        }
        if !(self.memory_threshold > 0.0 && self.memory_threshold <= 1.0) {
            return Err(Error::config(format!(
                "memory_threshold must be in (0, 1], got {}",
                self.memory_threshold
            )));
        }
        if self.presets.is_empty() {
            return Err(Error::config("at least one quality preset is required"));
        }
        if let Some(preset) = self.presets.iter().find(|p| p.height == 0 || p.crf > 51) {
            return Err(Error::config(format!(
                "invalid preset {}: height must be positive and crf at most 51",
                preset.label()
            )));
        }
        let mut heights: Vec<u32> = self.presets.iter().map(|p| p.height).collect();
        heights.sort_unstable();
        heights.dedup();
        if heights.len() != self.presets.len() {
            return Err(Error::config("preset heights must be unique"));
        }
        if self.manifest_filename.is_empty() || self.manifest_filename.contains('/') {
            return Err(Error::config("manifest_filename must be a plain file name"));
        }
        if self.thumbnail.width == 0 || self.thumbnail.height == 0 {
            return Err(Error::config("thumbnail size must be positive"));
        }
        Ok(())
    }

    pub fn process_timeout(&self) -> Duration {
        Duration::from_secs(self.process_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn resource_retry_interval(&self) -> Duration {
        Duration::from_millis(self.resource_retry_ms)
    }

    /// Directory holding every HLS artifact of a job.
    pub fn job_hls_dir(&self, job_id: &str) -> PathBuf {
        self.hls_dir.join(job_id)
    }

    pub fn manifest_path(&self, job_id: &str) -> PathBuf {
        self.job_hls_dir(job_id).join(&self.manifest_filename)
    }

    pub fn thumbnail_path(&self, job_id: &str) -> PathBuf {
        self.thumbnail_dir.join(format!("{job_id}.jpg"))
    }

    pub fn hls_url(&self, job_id: &str) -> String {
        format!(
            "{}/{}/{}",
            self.hls_url_prefix.trim_end_matches('/'),
            job_id,
            self.manifest_filename
        )
    }

    pub fn thumbnail_url(&self, job_id: &str) -> String {
        format!(
            "{}/{}.jpg",
            self.thumbnail_url_prefix.trim_end_matches('/'),
            job_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.max_concurrent, 2);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.process_timeout(), Duration::from_secs(1800));
        assert_eq!(config.memory_threshold, 0.9);
        assert_eq!(config.presets.len(), 3);
        assert_eq!(config.thumbnail.width, 320);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_paths_and_urls() {
        let config = PipelineConfig {
            hls_dir: PathBuf::from("/srv/hls"),
            thumbnail_dir: PathBuf::from("/srv/thumbs"),
            hls_url_prefix: "/hls/".to_string(),
            ..Default::default()
        };
        assert_eq!(
            config.manifest_path("abc"),
            PathBuf::from("/srv/hls/abc/playlist.m3u8")
        );
        assert_eq!(config.thumbnail_path("abc"), PathBuf::from("/srv/thumbs/abc.jpg"));
        assert_eq!(config.hls_url("abc"), "/hls/abc/playlist.m3u8");
        assert_eq!(config.thumbnail_url("abc"), "/thumbnails/abc.jpg");
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("TRANSCODER_MAX_CONCURRENT", "4"),
            ("TRANSCODER_MAX_RETRIES", "5"),
            ("TRANSCODER_MEMORY_THRESHOLD", "0.75"),
            ("TRANSCODER_HLS_DIR", "/data/hls"),
            ("TRANSCODER_PROCESS_TIMEOUT_SECS", "not-a-number"),
            ("FFMPEG_PATH", "  "),
        ]);
        let mut config = PipelineConfig {
            ffmpeg_path: "ffmpeg".to_string(),
            ..Default::default()
        };
        config.apply_env_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.max_concurrent, 4);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.memory_threshold, 0.75);
        assert_eq!(config.hls_dir, PathBuf::from("/data/hls"));
        assert_eq!(config.process_timeout_secs, 1800);
        assert_eq!(config.ffmpeg_path, "ffmpeg");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let zero = PipelineConfig {
            max_concurrent: 0,
            ..Default::default()
        };
        assert!(matches!(zero.validate(), Err(Error::Configuration(_))));

        let threshold = PipelineConfig {
            memory_threshold: 1.5,
            ..Default::default()
        };
        assert!(threshold.validate().is_err());

        let mut duplicate = PipelineConfig::default();
        duplicate.presets.push(duplicate.presets[0].clone());
        assert!(duplicate.validate().is_err());

        let nested = PipelineConfig {
            manifest_filename: "a/b.m3u8".to_string(),
            ..Default::default()
        };
        assert!(nested.validate().is_err());
    }

    #[test]
    fn test_from_file_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transcoder.json");
        std::fs::write(
            &path,
            r#"{"max_concurrent": 1, "presets": [{"height": 360, "crf": 26}]}"#,
        )
        .unwrap();

        let config = PipelineConfig::from_file(&path).unwrap();
        assert_eq!(config.max_concurrent, 1);
        assert_eq!(config.presets.len(), 1);
        assert_eq!(config.hls_dir, PathBuf::from("public/hls"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_missing() {
        let err = PipelineConfig::from_file(Path::new("/nonexistent/transcoder.json")).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
