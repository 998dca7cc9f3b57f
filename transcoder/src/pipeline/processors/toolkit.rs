//! [`MediaToolkit`] backed by the ffmpeg and ffprobe binaries.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use process_utils::tokio_command;
use tracing::{debug, info};

use super::encoder::{EncoderSettings, RenditionEncoder, default_threads};
use super::probe::MetadataProber;
use super::thumbnail::ThumbnailExtractor;
use super::traits::{
    MediaToolkit, ProgressFn, RenditionOutput, RenditionRequest, ThumbnailRequest, ToolContext,
    VideoMetadata,
};
use crate::config::PipelineConfig;
use crate::{Error, Result};

const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

pub struct FfmpegToolkit {
    prober: MetadataProber,
    encoder: RenditionEncoder,
    thumbnails: ThumbnailExtractor,
}

impl FfmpegToolkit {
    pub fn new(ffmpeg_path: impl Into<String>, ffprobe_path: impl Into<String>) -> Self {
        let ffmpeg_path = ffmpeg_path.into();
        Self {
            prober: MetadataProber::with_ffprobe_path(ffprobe_path),
            encoder: RenditionEncoder::with_ffmpeg_path(ffmpeg_path.clone()),
            thumbnails: ThumbnailExtractor::with_ffmpeg_path(ffmpeg_path),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        let mut toolkit = Self::new(&config.ffmpeg_path, &config.ffprobe_path);
        toolkit.encoder = toolkit.encoder.with_settings(EncoderSettings {
            segment_duration_secs: config.segment_duration_secs,
            keyframe_interval: config.keyframe_interval,
            audio_bitrate_kbps: config.audio_bitrate_kbps,
            threads: default_threads(),
        });
        toolkit
    }

    /// First line of `ffmpeg -version` and `ffprobe -version`.
    pub async fn versions(&self) -> Result<(String, String)> {
        let ffmpeg = version_line(self.encoder.ffmpeg_path()).await?;
        let ffprobe = version_line(self.prober.ffprobe_path()).await?;
        info!(%ffmpeg, %ffprobe, "Media tools available");
        Ok((ffmpeg, ffprobe))
    }
}

async fn version_line(program: &str) -> Result<String> {
    let mut cmd = tokio_command(program);
    cmd.arg("-version")
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let output = tokio::time::timeout(VERSION_CHECK_TIMEOUT, cmd.output())
        .await
        .map_err(|_| Error::config(format!("{program} -version did not finish")))?
        .map_err(|e| Error::config(format!("cannot run {program}: {e}")))?;

    if !output.status.success() {
        return Err(Error::config(format!(
            "{program} -version exited with {}",
            output.status
        )));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let line = stdout.lines().next().unwrap_or_default().trim().to_string();
    debug!(program, version = %line, "Tool version");
    Ok(line)
}

#[async_trait]
impl MediaToolkit for FfmpegToolkit {
    async fn verify(&self) -> Result<()> {
        self.versions().await.map(|_| ())
    }

    async fn probe(&self, ctx: &ToolContext, source: &Path) -> Result<VideoMetadata> {
        self.prober.probe(ctx, source).await
    }

    async fn encode_rendition(
        &self,
        ctx: &ToolContext,
        request: &RenditionRequest,
        on_progress: ProgressFn,
    ) -> Result<RenditionOutput> {
        self.encoder.encode(ctx, request, on_progress).await
    }

    async fn extract_thumbnail(
        &self,
        ctx: &ToolContext,
        request: &ThumbnailRequest,
    ) -> Result<PathBuf> {
        self.thumbnails.extract(ctx, request).await
    }
}
