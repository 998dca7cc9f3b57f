//! Process supervision of the ffmpeg/ffprobe wrappers and of the pipeline
//! driving them, using shell scripts that stand in for the real binaries.
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use process_utils::ProcessRegistry;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use transcoder::broadcast::ChannelBroadcaster;
use transcoder::config::PipelineConfig;
use transcoder::domain::{
    Job, JobStage, JobStatus, QualityPreset, Resolution, RetryPolicy, SpeedPreset,
};
use transcoder::pipeline::processors::{
    FfmpegToolkit, MetadataProber, ProgressFn, RenditionEncoder, RenditionRequest,
    ThumbnailExtractor, ThumbnailRequest, ToolContext, VideoMetadata, compute_bitrate_kbps,
};
use transcoder::pipeline::{FixedCapacity, Orchestrator, ResourceGuard};
use transcoder::store::{JobStore, MemoryJobStore};
use transcoder::Error;

const FFPROBE_OK: &str = r#"#!/bin/sh
cat <<'EOF'
{
  "streams": [
    { "codec_type": "audio", "sample_rate": "48000" },
    { "codec_type": "video", "width": 1920, "height": 1080, "r_frame_rate": "30000/1001" }
  ],
  "format": { "duration": "12.500000" }
}
EOF
"#;

const FFPROBE_AUDIO_ONLY: &str = r#"#!/bin/sh
echo '{"streams":[{"codec_type":"audio"}],"format":{"duration":"3.0"}}'
"#;

const FFPROBE_CORRUPT: &str = r#"#!/bin/sh
echo "moov atom not found" >&2
exit 1
"#;

/// Reports progress on stdout and writes the playlist named by the last argument.
const FFMPEG_ENCODE: &str = r#"#!/bin/sh
for last; do :; done
if [ "$1" = "-version" ]; then
  echo "ffmpeg version 7.1-test"
  exit 0
fi
printf 'frame=1\nout_time_us=2500000\nprogress=continue\n'
printf 'frame=2\nout_time_us=6250000\nprogress=continue\n'
printf 'frame=3\nout_time_us=12500000\nprogress=end\n'
echo '#EXTM3U' > "$last"
"#;

const FFMPEG_HANG: &str = r#"#!/bin/sh
if [ "$1" = "-version" ]; then
  echo "ffmpeg version 7.1-test"
  exit 0
fi
exec sleep 30
"#;

const FFMPEG_NO_OUTPUT: &str = r#"#!/bin/sh
echo "Conversion failed!" >&2
exit 0
"#;

/// Scripts are written once, before any test spawns a process, so no
/// child can inherit a script still open for writing.
fn scripts() -> &'static Path {
    static DIR: OnceLock<TempDir> = OnceLock::new();
    DIR.get_or_init(|| {
        let dir = tempfile::tempdir().unwrap();
        for (name, body) in [
            ("ffprobe-ok", FFPROBE_OK),
            ("ffprobe-audio-only", FFPROBE_AUDIO_ONLY),
            ("ffprobe-corrupt", FFPROBE_CORRUPT),
            ("ffmpeg-encode", FFMPEG_ENCODE),
            ("ffmpeg-hang", FFMPEG_HANG),
            ("ffmpeg-no-output", FFMPEG_NO_OUTPUT),
        ] {
            let path = dir.path().join(name);
            std::fs::write(&path, body).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        dir
    })
    .path()
}

fn script(name: &str) -> String {
    scripts().join(name).to_string_lossy().into_owned()
}

fn context(timeout: Duration) -> ToolContext {
    ToolContext {
        job_id: "job".to_string(),
        registry: Arc::new(ProcessRegistry::new()),
        permits: Arc::new(Semaphore::new(4)),
        shutdown: CancellationToken::new(),
        timeout,
    }
}

fn rendition_request(output_dir: &Path) -> RenditionRequest {
    RenditionRequest {
        source: PathBuf::from("/uploads/in.mp4"),
        output_dir: output_dir.to_path_buf(),
        preset: QualityPreset::new(720, 20, SpeedPreset::Medium),
        metadata: VideoMetadata {
            duration: 12.5,
            resolution: Resolution::new(1920, 1080),
            fps: Some(30.0),
        },
    }
}

fn recorder() -> (ProgressFn, Arc<Mutex<Vec<f64>>>) {
    let seen: Arc<Mutex<Vec<f64>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (Arc::new(move |p: f64| sink.lock().push(p)), seen)
}

#[tokio::test]
async fn test_probe_reads_first_video_stream() {
    let ctx = context(Duration::from_secs(10));
    let prober = MetadataProber::with_ffprobe_path(script("ffprobe-ok"));

    let metadata = prober.probe(&ctx, Path::new("/uploads/in.mp4")).await.unwrap();

    assert_eq!(metadata.resolution, Resolution::new(1920, 1080));
    assert_eq!(metadata.duration, 12.5);
    let fps = metadata.fps.unwrap();
    assert!((fps - 29.97).abs() < 0.01);
    assert!(ctx.registry.is_empty());
}

#[tokio::test]
async fn test_probe_without_video_stream() {
    let ctx = context(Duration::from_secs(10));
    let prober = MetadataProber::with_ffprobe_path(script("ffprobe-audio-only"));

    let err = prober.probe(&ctx, Path::new("/uploads/a.m4a")).await.unwrap_err();
    assert_eq!(err.to_string(), "Probe failed: No video stream found");
}

#[tokio::test]
async fn test_probe_failure_carries_stderr() {
    let ctx = context(Duration::from_secs(10));
    let prober = MetadataProber::with_ffprobe_path(script("ffprobe-corrupt"));

    let err = prober.probe(&ctx, Path::new("/uploads/bad.mp4")).await.unwrap_err();
    let message = err.to_string();
    assert!(matches!(err, Error::Probe(_)));
    assert!(message.contains("exit code 1"), "{message}");
    assert!(message.contains("moov atom not found"), "{message}");
    assert!(ctx.registry.is_empty());
}

#[tokio::test]
async fn test_missing_binary_is_a_probe_error() {
    let ctx = context(Duration::from_secs(10));
    let prober = MetadataProber::with_ffprobe_path("/nonexistent/ffprobe");

    let err = prober.probe(&ctx, Path::new("/uploads/in.mp4")).await.unwrap_err();
    assert!(matches!(err, Error::Probe(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_encode_streams_progress_and_plans_output() {
    let out = tempfile::tempdir().unwrap();
    let ctx = context(Duration::from_secs(10));
    let encoder = RenditionEncoder::with_ffmpeg_path(script("ffmpeg-encode"));
    let request = rendition_request(out.path());
    let (on_progress, seen) = recorder();

    let output = encoder.encode(&ctx, &request, on_progress).await.unwrap();

    assert_eq!(output.label, "720p");
    assert_eq!(output.resolution, Resolution::new(1280, 720));
    assert_eq!(output.bitrate_kbps, compute_bitrate_kbps(1280, 720, Some(30.0)));
    assert_eq!(output.playlist_path, out.path().join("720p.m3u8"));
    assert!(output.playlist_path.exists());
    assert_eq!(*seen.lock(), vec![20.0, 50.0, 100.0]);
    assert!(ctx.registry.is_empty());
}

#[tokio::test]
async fn test_encode_without_playlist_fails() {
    let out = tempfile::tempdir().unwrap();
    let ctx = context(Duration::from_secs(10));
    let encoder = RenditionEncoder::with_ffmpeg_path(script("ffmpeg-no-output"));
    let (on_progress, _) = recorder();

    let err = encoder
        .encode(&ctx, &rendition_request(out.path()), on_progress)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Encode(_)));
}

#[tokio::test]
async fn test_encode_timeout_kills_process() {
    let out = tempfile::tempdir().unwrap();
    let ctx = context(Duration::from_millis(300));
    let encoder = RenditionEncoder::with_ffmpeg_path(script("ffmpeg-hang"));
    let (on_progress, _) = recorder();

    let started = Instant::now();
    let err = encoder
        .encode(&ctx, &rendition_request(out.path()), on_progress)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Timeout { .. }), "{err}");
    assert!(err.to_string().starts_with("720p encode timed out"));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(ctx.registry.is_empty());
}

#[tokio::test]
async fn test_kill_all_interrupts_running_encode() {
    let out = tempfile::tempdir().unwrap();
    let ctx = context(Duration::from_secs(60));
    let encoder = RenditionEncoder::with_ffmpeg_path(script("ffmpeg-hang"));
    let request = rendition_request(out.path());
    let (on_progress, _) = recorder();

    let registry = ctx.registry.clone();
    let killer = async {
        while registry.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(registry.keys(), vec!["job/720p".to_string()]);
        registry.kill_all()
    };

    let (result, report) = tokio::time::timeout(
        Duration::from_secs(10),
        async { tokio::join!(encoder.encode(&ctx, &request, on_progress), killer) },
    )
    .await
    .unwrap();

    assert_eq!(report.killed, 1);
    assert!(result.unwrap_err().is_cancelled());
    assert!(ctx.registry.is_empty());
}

#[tokio::test]
async fn test_shutdown_prevents_spawn() {
    let ctx = context(Duration::from_secs(10));
    ctx.shutdown.cancel();
    let prober = MetadataProber::with_ffprobe_path(script("ffprobe-ok"));

    let err = prober.probe(&ctx, Path::new("/uploads/in.mp4")).await.unwrap_err();
    assert!(err.is_cancelled());
}

#[tokio::test]
async fn test_thumbnail_requires_image() {
    let out = tempfile::tempdir().unwrap();
    let ctx = context(Duration::from_secs(10));
    let extractor = ThumbnailExtractor::with_ffmpeg_path(script("ffmpeg-encode"));
    let request = ThumbnailRequest {
        source: PathBuf::from("/uploads/in.mp4"),
        output_path: out.path().join("thumbs").join("job.jpg"),
        width: 320,
        height: 240,
        position_secs: 6.25,
        quality: 2,
    };

    let path = extractor.extract(&ctx, &request).await.unwrap();
    assert_eq!(path, request.output_path);
    assert!(path.exists());

    let failing = ThumbnailExtractor::with_ffmpeg_path(script("ffmpeg-no-output"));
    let other = ThumbnailRequest {
        output_path: out.path().join("other.jpg"),
        ..request
    };
    let err = failing.extract(&ctx, &other).await.unwrap_err();
    assert!(matches!(err, Error::Thumbnail(_)));
}

#[tokio::test]
async fn test_toolkit_versions() {
    let toolkit = FfmpegToolkit::new(script("ffmpeg-encode"), script("ffmpeg-encode"));
    let (ffmpeg, _) = toolkit.versions().await.unwrap();
    assert_eq!(ffmpeg, "ffmpeg version 7.1-test");

    let missing = FfmpegToolkit::new("/nonexistent/ffmpeg", script("ffmpeg-encode"));
    assert!(missing.versions().await.is_err());
}

/// Pipeline over the scripted tools, with one job record ready to submit.
struct Pipeline {
    _dir: TempDir,
    store: Arc<MemoryJobStore>,
    orchestrator: Orchestrator,
    source: PathBuf,
}

impl Pipeline {
    async fn new(ffmpeg: &str, tweak: impl FnOnce(&mut PipelineConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig {
            upload_dir: dir.path().join("uploads"),
            hls_dir: dir.path().join("hls"),
            thumbnail_dir: dir.path().join("thumbnails"),
            shutdown_timeout_secs: 5,
            ..PipelineConfig::default()
        };
        tweak(&mut config);

        let store = Arc::new(MemoryJobStore::new());
        let guard = ResourceGuard::new(
            Arc::new(FixedCapacity::new(0.5)),
            config.memory_threshold,
            None,
            config.hls_dir.clone(),
        );
        let orchestrator = Orchestrator::new(
            config.clone(),
            store.clone(),
            Arc::new(ChannelBroadcaster::new()),
            Arc::new(FfmpegToolkit::new(script(ffmpeg), script("ffprobe-ok"))),
            guard,
        );
        orchestrator.init().await.unwrap();

        let source = config.upload_dir.join("clip.mp4");
        std::fs::write(&source, b"not really a video").unwrap();
        store.create(Job::new("clip", &source)).unwrap();

        Self {
            _dir: dir,
            store,
            orchestrator,
            source,
        }
    }

    async fn wait_until(&self, done: impl Fn(&Job) -> bool) -> Job {
        tokio::time::timeout(Duration::from_secs(20), async {
            loop {
                let job = self.store.get("clip").await.unwrap();
                if done(&job) {
                    return job;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("job did not reach the expected state")
    }
}

#[tokio::test]
async fn test_pipeline_retries_timed_out_encodes_then_fails() {
    let pipeline = Pipeline::new("ffmpeg-hang", |c| {
        c.process_timeout_secs = 1;
        c.retry = RetryPolicy::immediate(2);
    })
    .await;

    let started = Instant::now();
    pipeline
        .orchestrator
        .submit(&pipeline.source, "clip")
        .await
        .unwrap();
    let job = pipeline.wait_until(|job| job.is_terminal()).await;

    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.unwrap_or_default();
    assert!(error.ends_with("timed out after 1s"), "{error}");
    // Both attempts ran into the time limit.
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert!(pipeline.orchestrator.registry().is_empty());
    assert!(!pipeline.source.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cleanup_counts_every_killed_tool() {
    let pipeline = Pipeline::new("ffmpeg-hang", |c| {
        c.process_timeout_secs = 60;
        c.max_tool_processes = 1;
    })
    .await;
    pipeline
        .orchestrator
        .submit(&pipeline.source, "clip")
        .await
        .unwrap();

    let registry = pipeline.orchestrator.registry().clone();
    tokio::time::timeout(Duration::from_secs(10), async {
        while !registry.keys().iter().any(|key| !key.ends_with("/probe")) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let report = pipeline.orchestrator.cleanup().await;

    assert_eq!(report.killed_processes, 1);
    assert_eq!(report.kill_failures, 0);
    assert_eq!(report.interrupted, vec!["clip".to_string()]);
    assert!(!report.timed_out);
    assert!(registry.is_empty());
    let job = pipeline.store.get("clip").await.unwrap();
    assert_eq!(job.stage, JobStage::Transcoding);
}
