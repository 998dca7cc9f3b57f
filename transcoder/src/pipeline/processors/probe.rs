//! Source metadata extraction through ffprobe.

use std::path::Path;

use process_utils::tokio_command;
use serde::Deserialize;
use tracing::{debug, info};

use super::traits::{ToolContext, VideoMetadata};
use super::utils::run_tool_capture;
use crate::domain::Resolution;
use crate::{Error, Result};

/// Largest frame edge accepted from a source.
pub const MAX_DIMENSION: u32 = 16384;

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    #[serde(default)]
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    #[serde(default)]
    codec_type: Option<String>,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    r_frame_rate: Option<String>,
    #[serde(default)]
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    #[serde(default)]
    duration: Option<String>,
}

/// Runs ffprobe and interprets its JSON report.
pub struct MetadataProber {
    ffprobe_path: String,
}

impl MetadataProber {
    pub fn new() -> Self {
        Self {
            ffprobe_path: std::env::var("FFPROBE_PATH").unwrap_or_else(|_| "ffprobe".to_string()),
        }
    }

    pub fn with_ffprobe_path(path: impl Into<String>) -> Self {
        Self {
            ffprobe_path: path.into(),
        }
    }

    pub fn ffprobe_path(&self) -> &str {
        &self.ffprobe_path
    }

    pub fn build_args(source: &Path) -> Vec<String> {
        vec![
            "-v".to_string(),
            "quiet".to_string(),
            "-print_format".to_string(),
            "json".to_string(),
            "-show_format".to_string(),
            "-show_streams".to_string(),
            source.to_string_lossy().into_owned(),
        ]
    }

    pub async fn probe(&self, ctx: &ToolContext, source: &Path) -> Result<VideoMetadata> {
        let mut cmd = tokio_command(&self.ffprobe_path);
        cmd.args(Self::build_args(source)).env("LC_ALL", "C");

        let output = run_tool_capture(ctx, "probe", cmd)
            .await
            .map_err(|e| e.into_error("probe", Error::Probe))?;

        if !output.success() {
            return Err(Error::Probe(format!(
                "ffprobe failed on {}: {}",
                source.display(),
                output.failure_message()
            )));
        }

        let metadata = parse_probe_output(&output.stdout)?;
        info!(
            job_id = %ctx.job_id,
            duration = metadata.duration,
            resolution = %metadata.resolution,
            fps = ?metadata.fps,
            "Probed source"
        );
        Ok(metadata)
    }
}

impl Default for MetadataProber {
    fn default() -> Self {
        Self::new()
    }
}

/// Interpret ffprobe's `-print_format json` output.
pub fn parse_probe_output(json: &str) -> Result<VideoMetadata> {
    let output: ProbeOutput = serde_json::from_str(json)
        .map_err(|e| Error::Probe(format!("unparseable ffprobe output: {}", e)))?;

    let video = output
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| Error::Probe("No video stream found".to_string()))?;

    let (width, height) = match (video.width, video.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => return Err(Error::Probe("video stream has no dimensions".to_string())),
    };
    if width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(Error::Probe(format!("unsupported frame size {width}x{height}")));
    }

    let duration = output
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .or(video.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d >= 0.0)
        .unwrap_or(0.0);

    let fps = video.r_frame_rate.as_deref().and_then(parse_frame_rate);
    debug!(width, height, duration, ?fps, "Parsed ffprobe output");

    Ok(VideoMetadata {
        duration,
        resolution: Resolution::new(width, height),
        fps,
    })
}

/// Parse a rational frame rate such as `30000/1001` or a plain `25`.
pub fn parse_frame_rate(rate: &str) -> Option<f64> {
    let fps = match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => rate.trim().parse().ok()?,
    };
    (fps.is_finite() && fps > 0.0).then_some(fps)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "streams": [
            {"index": 0, "codec_type": "audio", "r_frame_rate": "0/0"},
            {"index": 1, "codec_type": "video", "width": 1920, "height": 1080,
             "r_frame_rate": "30000/1001", "duration": "12.000000"}
        ],
        "format": {"filename": "in.mp4", "duration": "12.345000"}
    }"#;

    #[test]
    fn test_parse_sample() {
        let metadata = parse_probe_output(SAMPLE).unwrap();
        assert_eq!(metadata.resolution, Resolution::new(1920, 1080));
        assert!((metadata.duration - 12.345).abs() < 1e-9);
        let fps = metadata.fps.unwrap();
        assert!((fps - 29.97).abs() < 0.01);
    }

    #[test]
    fn test_no_video_stream() {
        let err = parse_probe_output(r#"{"streams": [{"codec_type": "audio"}], "format": {}}"#)
            .unwrap_err();
        assert_eq!(err.to_string(), "Probe failed: No video stream found");

        let err = parse_probe_output(r#"{}"#).unwrap_err();
        assert!(matches!(err, Error::Probe(_)));
    }

    #[test]
    fn test_unparseable() {
        assert!(matches!(parse_probe_output("not json"), Err(Error::Probe(_))));
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let err = parse_probe_output(
            r#"{"streams": [{"codec_type": "video", "width": 4294967295, "height": 1}]}"#,
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "Probe failed: unsupported frame size 4294967295x1");
    }

    #[test]
    fn test_missing_duration_defaults_to_zero() {
        let metadata = parse_probe_output(
            r#"{"streams": [{"codec_type": "video", "width": 640, "height": 360}]}"#,
        )
        .unwrap();
        assert_eq!(metadata.duration, 0.0);
        assert!(metadata.fps.is_none());
    }

    #[test]
    fn test_parse_frame_rate() {
        assert_eq!(parse_frame_rate("25/1"), Some(25.0));
        assert_eq!(parse_frame_rate("60"), Some(60.0));
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("abc"), None);
    }

    #[test]
    fn test_build_args() {
        let args = MetadataProber::build_args(Path::new("/up/in.mp4"));
        assert_eq!(
            args,
            vec![
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
                "/up/in.mp4"
            ]
        );
    }
}
