use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use transcoder::logging::init_logging;
use transcoder::pipeline::{FfmpegToolkit, ResourceGuard};
use transcoder::{
    ChannelBroadcaster, Job, JobStatus, MemoryJobStore, Orchestrator, PipelineConfig,
    PipelineEvent,
};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory for rolling log files
    #[arg(long, env = "TRANSCODER_LOG_DIR", default_value = "logs")]
    log_dir: PathBuf,

    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Transcode one or more video files into HLS renditions
    Run {
        /// Video files to transcode. They are copied into the upload directory first.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Check that ffmpeg and ffprobe run and report resource headroom
    Check,
    /// Delete everything in the upload, HLS and thumbnail directories
    Clean,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = PipelineConfig::from_env().context("Failed to load configuration")?;

    let (logging, _guard) = init_logging(&args.log_dir).context("Failed to initialize logging")?;
    if args.verbose && std::env::var_os("RUST_LOG").is_none() {
        logging.set_filter("transcoder=debug,process_utils=debug")?;
    }
    let shutdown = CancellationToken::new();
    logging.start_retention_cleanup(shutdown.clone());

    let result = match args.command {
        Command::Run { files } => run(config, files).await,
        Command::Check => check(config).await,
        Command::Clean => clean(&config).await,
    };
    shutdown.cancel();
    result
}

async fn run(config: PipelineConfig, files: Vec<PathBuf>) -> anyhow::Result<()> {
    let store = Arc::new(MemoryJobStore::new());
    let broadcaster = Arc::new(ChannelBroadcaster::new());
    let mut events = broadcaster.subscribe();

    let orchestrator = Orchestrator::with_ffmpeg(config, store.clone(), broadcaster.clone());
    orchestrator
        .init()
        .await
        .context("Failed to initialize pipeline")?;

    let mut pending = HashSet::new();
    for file in &files {
        let job_id = uuid::Uuid::new_v4().to_string();
        let source = stage_upload(orchestrator.config(), file, &job_id)
            .await
            .with_context(|| format!("Failed to stage {}", file.display()))?;

        store.create(Job::new(&job_id, &source))?;
        info!(job_id = %job_id, file = %file.display(), "Submitting");
        match orchestrator.submit(&source, &job_id).await {
            Ok(()) => {
                pending.insert(job_id);
            }
            Err(e) => error!(job_id = %job_id, error = %e, "Job rejected"),
        }
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    while !pending.is_empty() {
        tokio::select! {
            _ = &mut ctrl_c => {
                warn!("Interrupted, shutting down");
                break;
            }
            event = events.recv() => match event {
                Ok(PipelineEvent::Progress { video_id, progress, stage, details, .. }) => {
                    debug!(
                        job_id = %video_id,
                        progress,
                        %stage,
                        eta_secs = details.eta_secs,
                        "Progress"
                    );
                }
                Ok(PipelineEvent::Status { video_id, status, .. }) => {
                    if status != JobStatus::Processing {
                        pending.remove(&video_id);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Event subscriber lagged");
                    pending.retain(|id| {
                        store
                            .list()
                            .iter()
                            .any(|job| &job.id == id && !job.is_terminal())
                    });
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    let report = orchestrator.cleanup().await;
    if !report.abandoned.is_empty() || !report.interrupted.is_empty() {
        warn!(
            abandoned = ?report.abandoned,
            interrupted = ?report.interrupted,
            "Some jobs did not finish"
        );
    }

    let stats = orchestrator.stats();
    println!("{} completed, {} failed", stats.completed, stats.failed);
    for job in store.list() {
        match job.status {
            JobStatus::Ready => println!(
                "  {}  ready   {}  [{}]",
                job.id,
                job.hls_url.as_deref().unwrap_or_default(),
                job.renditions.join(", ")
            ),
            JobStatus::Failed => println!(
                "  {}  failed  {}",
                job.id,
                job.error.as_deref().unwrap_or_default()
            ),
            JobStatus::Processing => println!("  {}  {}  {}%", job.id, job.stage, job.progress),
        }
    }

    if stats.failed > 0 {
        anyhow::bail!("{} job(s) failed", stats.failed);
    }
    Ok(())
}

/// Copy `file` into the upload directory. The pipeline deletes its source
/// once a job finishes, so the user's file is never handed over directly.
async fn stage_upload(
    config: &PipelineConfig,
    file: &Path,
    job_id: &str,
) -> anyhow::Result<PathBuf> {
    let name = match file.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{job_id}.{ext}"),
        None => job_id.to_string(),
    };
    let dest = config.upload_dir.join(name);
    tokio::fs::copy(file, &dest).await?;
    Ok(dest)
}

async fn check(config: PipelineConfig) -> anyhow::Result<()> {
    let toolkit = FfmpegToolkit::from_config(&config);
    let (ffmpeg, ffprobe) = toolkit.versions().await?;
    println!("ffmpeg:  {ffmpeg}");
    println!("ffprobe: {ffprobe}");

    let guard = ResourceGuard::system(
        config.memory_threshold,
        config.min_free_disk_bytes,
        config.hls_dir.clone(),
    );
    let status = guard.check();
    println!("resources: {}", status.reason());
    if !status.is_available() {
        anyhow::bail!("not enough resources to accept jobs");
    }
    Ok(())
}

async fn clean(config: &PipelineConfig) -> anyhow::Result<()> {
    for dir in [&config.upload_dir, &config.hls_dir, &config.thumbnail_dir] {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => info!(dir = %dir.display(), "Removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("Failed to remove {}", dir.display())),
        }
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    println!("cleaned");
    Ok(())
}
