//! Thumbnail extraction through ffmpeg.

use std::path::PathBuf;

use process_utils::tokio_command;
use tracing::info;

use super::traits::{ThumbnailRequest, ToolContext};
use super::utils::run_tool_capture;
use crate::{Error, Result};

/// Seek position for a thumbnail: the preferred offset, but never past the
/// middle of the video.
pub fn thumbnail_position(offset_secs: f64, duration_secs: f64) -> f64 {
    let offset = offset_secs.max(0.0);
    if duration_secs > 0.0 {
        offset.min(duration_secs / 2.0)
    } else {
        0.0
    }
}

/// Extracts a single JPEG frame.
pub struct ThumbnailExtractor {
    ffmpeg_path: String,
}

impl ThumbnailExtractor {
    pub fn new() -> Self {
        Self {
            ffmpeg_path: std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string()),
        }
    }

    pub fn with_ffmpeg_path(path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: path.into(),
        }
    }

    pub fn build_args(request: &ThumbnailRequest) -> Vec<String> {
        vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-ss".to_string(),
            format!("{:.2}", request.position_secs),
            "-i".to_string(),
            request.source.to_string_lossy().into_owned(),
            "-frames:v".to_string(),
            "1".to_string(),
            "-vf".to_string(),
            format!("scale={}:{}", request.width, request.height),
            "-q:v".to_string(),
            request.quality.to_string(),
            request.output_path.to_string_lossy().into_owned(),
        ]
    }

    pub async fn extract(&self, ctx: &ToolContext, request: &ThumbnailRequest) -> Result<PathBuf> {
        if let Some(parent) = request.output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut cmd = tokio_command(&self.ffmpeg_path);
        cmd.args(Self::build_args(request)).env("LC_ALL", "C");

        let output = run_tool_capture(ctx, "thumbnail", cmd)
            .await
            .map_err(|e| e.into_error("thumbnail", Error::Thumbnail))?;

        if !output.success() {
            return Err(Error::Thumbnail(output.failure_message()));
        }
        if !tokio::fs::try_exists(&request.output_path)
            .await
            .unwrap_or(false)
        {
            return Err(Error::Thumbnail("ffmpeg produced no image".to_string()));
        }

        info!(
            job_id = %ctx.job_id,
            path = %request.output_path.display(),
            position_secs = request.position_secs,
            "Thumbnail extracted"
        );
        Ok(request.output_path.clone())
    }
}

impl Default for ThumbnailExtractor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thumbnail_position() {
        assert_eq!(thumbnail_position(10.0, 120.0), 10.0);
        assert_eq!(thumbnail_position(10.0, 8.0), 4.0);
        assert_eq!(thumbnail_position(10.0, 0.0), 0.0);
        assert_eq!(thumbnail_position(-3.0, 60.0), 0.0);
    }

    #[test]
    fn test_build_args() {
        let request = ThumbnailRequest {
            source: PathBuf::from("/up/in.mp4"),
            output_path: PathBuf::from("/thumbs/abc.jpg"),
            width: 320,
            height: 240,
            position_secs: 4.0,
            quality: 2,
        };
        let args = ThumbnailExtractor::build_args(&request).join(" ");
        assert_eq!(
            args,
            "-y -hide_banner -loglevel error -ss 4.00 -i /up/in.mp4 -frames:v 1 \
             -vf scale=320:240 -q:v 2 /thumbs/abc.jpg"
        );
    }
}
