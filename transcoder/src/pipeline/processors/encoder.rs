//! HLS rendition encoding through ffmpeg.

use std::path::Path;

use process_utils::tokio_command;
use tracing::{debug, info};

use super::ffmpeg_progress::ProgressParser;
use super::traits::{ProgressFn, RenditionOutput, RenditionRequest, ToolContext};
use super::utils::run_tool_streaming;
use crate::domain::Resolution;
use crate::{Error, Result};

/// Frame rate assumed when the source does not report one.
pub const DEFAULT_FPS: f64 = 30.0;

const BITS_PER_PIXEL: f64 = 0.1;

/// Target video bitrate for a frame size, in kbit/s.
///
/// `round(width * height * fps * 0.1 / 1000)`, with `fps` defaulting to 30.
pub fn compute_bitrate_kbps(width: u32, height: u32, fps: Option<f64>) -> u32 {
    let fps = fps.filter(|f| f.is_finite() && *f > 0.0).unwrap_or(DEFAULT_FPS);
    let bits_per_second = width as f64 * height as f64 * BITS_PER_PIXEL * fps;
    (bits_per_second / 1000.0).round() as u32
}

/// Segment and GOP settings shared by every rendition.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderSettings {
    pub segment_duration_secs: u32,
    pub keyframe_interval: u32,
    pub audio_bitrate_kbps: u32,
    pub threads: usize,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            segment_duration_secs: 4,
            keyframe_interval: 48,
            audio_bitrate_kbps: 128,
            threads: default_threads(),
        }
    }
}

/// Half the available cores, but at least two.
pub fn default_threads() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    (cpus / 2).max(2)
}

/// Encodes one rendition as a VOD HLS playlist with `.ts` segments.
pub struct RenditionEncoder {
    ffmpeg_path: String,
    settings: EncoderSettings,
}

impl RenditionEncoder {
    pub fn new() -> Self {
        Self {
            ffmpeg_path: std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string()),
            settings: EncoderSettings::default(),
        }
    }

    pub fn with_ffmpeg_path(path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: path.into(),
            settings: EncoderSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: EncoderSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn ffmpeg_path(&self) -> &str {
        &self.ffmpeg_path
    }

    /// Output frame size and bitrate for a request.
    pub fn plan(request: &RenditionRequest) -> (Resolution, u32) {
        let height = request.preset.height;
        let width = request.metadata.resolution.scaled_width(height);
        let resolution = Resolution::new(width, height);
        let bitrate = request
            .preset
            .bitrate_kbps
            .unwrap_or_else(|| compute_bitrate_kbps(width, height, request.metadata.fps));
        (resolution, bitrate.max(1))
    }

    pub fn build_args(&self, request: &RenditionRequest, bitrate_kbps: u32) -> Vec<String> {
        let preset = &request.preset;
        let bitrate = format!("{}k", bitrate_kbps);
        let keyint = self.settings.keyframe_interval.to_string();

        let mut args: Vec<String> = Vec::new();
        args.extend(["-y", "-hide_banner", "-nostats"].map(String::from));
        args.extend(["-loglevel", "error", "-progress", "pipe:1"].map(String::from));
        args.push("-i".to_string());
        args.push(request.source.to_string_lossy().into_owned());

        args.extend(["-c:v", "libx264", "-profile:v", "main"].map(String::from));
        args.extend(["-crf".to_string(), preset.crf.to_string()]);
        args.extend(["-preset".to_string(), preset.speed.as_str().to_string()]);
        args.extend(["-sc_threshold", "0"].map(String::from));
        args.extend(["-g".to_string(), keyint.clone()]);
        args.extend(["-keyint_min".to_string(), keyint]);
        args.extend(["-b:v".to_string(), bitrate.clone()]);
        args.extend(["-maxrate".to_string(), bitrate.clone()]);
        args.extend(["-bufsize".to_string(), bitrate]);
        args.extend(["-vf".to_string(), format!("scale=-2:{}", preset.height)]);

        args.extend(["-c:a", "aac"].map(String::from));
        args.extend([
            "-b:a".to_string(),
            format!("{}k", self.settings.audio_bitrate_kbps),
        ]);
        args.extend(["-ac", "2"].map(String::from));
        args.extend(["-threads".to_string(), self.settings.threads.to_string()]);

        args.extend(["-f", "hls"].map(String::from));
        args.extend([
            "-hls_time".to_string(),
            self.settings.segment_duration_secs.to_string(),
        ]);
        args.extend(["-hls_list_size", "0", "-hls_playlist_type", "vod"].map(String::from));
        args.push("-hls_segment_filename".to_string());
        args.push(request.segment_pattern().to_string_lossy().into_owned());
        args.push(request.playlist_path().to_string_lossy().into_owned());
        args
    }

    pub async fn encode(
        &self,
        ctx: &ToolContext,
        request: &RenditionRequest,
        on_progress: ProgressFn,
    ) -> Result<RenditionOutput> {
        let label = request.label();
        let (resolution, bitrate_kbps) = Self::plan(request);
        ensure_dir(&request.output_dir).await?;

        let args = self.build_args(request, bitrate_kbps);
        debug!(job_id = %ctx.job_id, rendition = %label, "ffmpeg {}", args.join(" "));

        let mut cmd = tokio_command(&self.ffmpeg_path);
        cmd.args(&args).env("LC_ALL", "C");

        let mut parser = ProgressParser::new(request.metadata.duration);
        let output = run_tool_streaming(ctx, &label, cmd, |line| {
            if let Some(percent) = parser.feed(line) {
                on_progress(percent);
            }
        })
        .await
        .map_err(|e| e.into_error(&format!("{label} encode"), Error::Encode))?;

        if !output.success() {
            return Err(Error::Encode(format!(
                "{} rendition: {}",
                label,
                output.failure_message()
            )));
        }

        let playlist_path = request.playlist_path();
        if !tokio::fs::try_exists(&playlist_path).await.unwrap_or(false) {
            return Err(Error::Encode(format!(
                "{} rendition: ffmpeg produced no playlist",
                label
            )));
        }

        info!(
            job_id = %ctx.job_id,
            rendition = %label,
            %resolution,
            bitrate_kbps,
            elapsed_secs = output.duration.as_secs_f64(),
            "Rendition encoded"
        );

        Ok(RenditionOutput {
            label,
            resolution,
            bitrate_kbps,
            playlist_path,
        })
    }
}

impl Default for RenditionEncoder {
    fn default() -> Self {
        Self::new()
    }
}

async fn ensure_dir(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    Ok(())
}
