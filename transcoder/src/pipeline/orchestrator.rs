//! Job orchestrator: admission, stage sequencing, retries and shutdown.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures::future::try_join_all;
use process_utils::ProcessRegistry;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::admission::{AdmissionQueue, AdmissionStats, EnqueueError, QueuedJob};
use super::processors::{
    FfmpegToolkit, ManifestEntry, MediaToolkit, ProgressFn, RenditionOutput, RenditionRequest,
    ThumbnailRequest, ToolContext, VideoMetadata, build_master_playlist, thumbnail_position,
};
use super::progress::{ProgressHandle, spawn_progress_aggregator};
use super::resource::ResourceGuard;
use super::retry::retry_stage;
use crate::broadcast::Broadcaster;
use crate::config::PipelineConfig;
use crate::domain::{Job, JobStage, JobUpdate, ProcessingStatus, QualityPreset};
use crate::store::JobStore;
use crate::{Error, Result};

/// Counters exposed for instrumentation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub active: usize,
    pub queued: usize,
    pub peak_active: usize,
    pub completed: u64,
    pub failed: u64,
}

/// What shutdown left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// External processes that accepted the kill request.
    pub killed_processes: usize,
    /// Processes whose kill request failed.
    pub kill_failures: usize,
    /// Queued jobs that never started. They remain `processing`.
    pub abandoned: Vec<String>,
    /// Jobs that were running. They remain in their last persisted stage.
    pub interrupted: Vec<String>,
    /// Whether running jobs had to be aborted after the grace period.
    pub timed_out: bool,
}

/// Artifacts of a successful transcoding stage.
struct TranscodeOutput {
    renditions: Vec<RenditionOutput>,
    thumbnail: PathBuf,
}

struct Inner {
    config: PipelineConfig,
    store: Arc<dyn JobStore>,
    toolkit: Arc<dyn MediaToolkit>,
    guard: ResourceGuard,
    registry: Arc<ProcessRegistry<String>>,
    permits: Arc<Semaphore>,
    queue: AdmissionQueue,
    progress: ProgressHandle,
    shutdown: CancellationToken,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
    repump_armed: AtomicBool,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Handle to the transcoding pipeline. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Build an orchestrator. Must be called inside a tokio runtime.
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn JobStore>,
        broadcaster: Arc<dyn Broadcaster>,
        toolkit: Arc<dyn MediaToolkit>,
        guard: ResourceGuard,
    ) -> Self {
        let (progress, _aggregator) = spawn_progress_aggregator(store.clone(), broadcaster);
        Self {
            inner: Arc::new(Inner {
                registry: Arc::new(ProcessRegistry::new()),
                permits: Arc::new(Semaphore::new(config.max_tool_processes.max(1))),
                queue: AdmissionQueue::new(config.max_concurrent),
                progress,
                shutdown: CancellationToken::new(),
                tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
                repump_armed: AtomicBool::new(false),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                config,
                store,
                toolkit,
                guard,
            }),
        }
    }

    /// Orchestrator using ffmpeg/ffprobe and the host's resource readings.
    pub fn with_ffmpeg(
        config: PipelineConfig,
        store: Arc<dyn JobStore>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Self {
        let toolkit = Arc::new(FfmpegToolkit::from_config(&config));
        let guard = ResourceGuard::system(
            config.memory_threshold,
            config.min_free_disk_bytes,
            config.hls_dir.clone(),
        );
        Self::new(config, store, broadcaster, toolkit, guard)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry<String>> {
        &self.inner.registry
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Create the working directories and check that the media tools run.
    pub async fn init(&self) -> Result<()> {
        let config = &self.inner.config;
        for dir in [&config.upload_dir, &config.hls_dir, &config.thumbnail_dir] {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                Error::config(format!("cannot create {}: {}", dir.display(), e))
            })?;
        }
        self.inner.toolkit.verify().await?;
        info!(
            hls_dir = %config.hls_dir.display(),
            thumbnail_dir = %config.thumbnail_dir.display(),
            max_concurrent = config.max_concurrent,
            "Transcoding pipeline initialized"
        );
        Ok(())
    }

    /// Queue `source` for transcoding as job `job_id`.
    ///
    /// The job record must already exist. The outcome is observed through
    /// the store and the broadcaster; an error is returned only when the job
    /// is rejected here. Under resource pressure the job is also failed.
    pub async fn submit(&self, source: impl Into<PathBuf>, job_id: &str) -> Result<()> {
        let source = source.into();
        if self.is_shutting_down() {
            return Err(Error::Cancelled("pipeline is shutting down".to_string()));
        }
        if self.inner.queue.contains(job_id) {
            return Err(Error::Other(format!("job {job_id} is already queued or running")));
        }

        // Only a live record may own the source; anything else leaves it alone.
        let job = self.inner.store.get(job_id).await?;
        if job.is_terminal() {
            return Err(Error::InvalidStateTransition {
                from: job.stage.to_string(),
                to: JobStage::Initializing.to_string(),
            });
        }

        let capacity = self.inner.guard.check();
        if !capacity.is_available() {
            let err = Error::ResourceExhausted(capacity.reason());
            warn!(job_id, reason = %capacity.reason(), "Rejecting job");
            self.inner.failed.fetch_add(1, Ordering::Relaxed);
            self.fail_job(job_id, &source, &err).await;
            return Err(err);
        }

        self.inner
            .progress
            .transition(job_id, JobUpdate::stage(JobStage::Initializing))
            .await?;

        match self.inner.queue.enqueue(QueuedJob::new(job_id, &source)) {
            Ok(()) => {}
            Err(EnqueueError::Closed) => {
                return Err(Error::Cancelled("pipeline is shutting down".to_string()));
            }
            Err(e @ EnqueueError::Duplicate(_)) => return Err(Error::Other(e.to_string())),
        }
        info!(job_id, source = %source.display(), "Job queued");

        self.pump();
        Ok(())
    }

    /// Current status of a job.
    pub async fn status(&self, job_id: &str) -> Result<ProcessingStatus> {
        let job = self.inner.store.get(job_id).await?;
        Ok(ProcessingStatus::from(&job))
    }

    pub fn stats(&self) -> PipelineStats {
        let AdmissionStats {
            active,
            queued,
            peak_active,
        } = self.inner.queue.stats();
        PipelineStats {
            active,
            queued,
            peak_active,
            completed: self.inner.completed.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
        }
    }

    /// Shut down: kill every running tool, abandon queued jobs and wait for
    /// running jobs to unwind.
    ///
    /// Abandoned and interrupted jobs are left as they are and reported.
    pub async fn cleanup(&self) -> ShutdownReport {
        info!("Shutting down transcoding pipeline");

        // Kill switches are children of the shutdown token, so drain the
        // registry before cancelling or tools deregister themselves first.
        let mut kills = self.inner.registry.kill_all();
        self.inner.shutdown.cancel();
        let late = self.inner.registry.kill_all();
        kills.killed += late.killed;
        kills.failed.extend(late.failed);

        let abandoned: Vec<String> = self
            .inner
            .queue
            .close()
            .into_iter()
            .map(|job| job.job_id)
            .collect();
        let interrupted = self.inner.queue.active_ids();
        for job_id in &abandoned {
            warn!(job_id = %job_id, "Queued job abandoned by shutdown");
        }

        let join_set = self.inner.tasks.lock().take();
        let mut timed_out = false;
        if let Some(mut join_set) = join_set {
            let drain = async { while join_set.join_next().await.is_some() {} };
            if tokio::time::timeout(self.inner.config.shutdown_timeout(), drain)
                .await
                .is_err()
            {
                warn!("Running jobs did not stop in time, aborting");
                join_set.abort_all();
                timed_out = true;
            }
        }

        let report = ShutdownReport {
            killed_processes: kills.killed,
            kill_failures: kills.failed.len(),
            abandoned,
            interrupted,
            timed_out,
        };
        info!(
            killed = report.killed_processes,
            abandoned = report.abandoned.len(),
            interrupted = report.interrupted.len(),
            "Transcoding pipeline stopped"
        );
        report
    }

    /// Admit queued jobs while slots and resources allow.
    fn pump(&self) {
        while !self.is_shutting_down() && self.inner.queue.can_admit() {
            let capacity = self.inner.guard.check();
            if !capacity.is_available() {
                info!(
                    queued = self.inner.queue.pending_count(),
                    reason = %capacity.reason(),
                    "Holding queued jobs back"
                );
                if self.inner.queue.active_count() == 0 {
                    self.arm_repump();
                }
                return;
            }

            let Some(job) = self.inner.queue.try_admit() else {
                return;
            };
            self.spawn_job(job);
        }
    }

    /// Retry admission later when nothing running would trigger it.
    fn arm_repump(&self) {
        if self.inner.repump_armed.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        let delay = self.inner.config.resource_retry_interval();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    this.inner.repump_armed.store(false, Ordering::SeqCst);
                    this.pump();
                }
                _ = this.inner.shutdown.cancelled() => {}
            }
        });
    }

    fn spawn_job(&self, job: QueuedJob) {
        let this = self.clone();
        let job_id = job.job_id.clone();
        let span = info_span!("job", job_id = %job_id);

        let mut tasks = self.inner.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            // Shutdown took the task set between admission and spawn.
            self.inner.queue.complete(&job_id);
            return;
        };
        while join_set.try_join_next().is_some() {}

        join_set.spawn(
            async move {
                this.run_job(&job).await;
                this.inner.queue.complete(&job.job_id);
                this.pump();
            }
            .instrument(span),
        );
    }

    async fn run_job(&self, job: &QueuedJob) {
        let job_id = job.job_id.as_str();
        info!(
            waited_ms = job.enqueued_at.elapsed().as_millis() as u64,
            "Job started"
        );

        match self.process(job).await {
            Ok(done) => {
                self.inner.completed.fetch_add(1, Ordering::Relaxed);
                info!(
                    renditions = ?done.renditions,
                    hls_url = done.hls_url.as_deref().unwrap_or_default(),
                    "Job ready"
                );
            }
            Err(e) if e.is_cancelled() => {
                info!(error = %e, "Job interrupted by shutdown");
            }
            Err(e) => {
                self.inner.failed.fetch_add(1, Ordering::Relaxed);
                self.fail_job(job_id, &job.source, &e).await;
            }
        }
        self.inner.progress.forget(job_id).await;
    }

    async fn process(&self, job: &QueuedJob) -> Result<Job> {
        let inner = &self.inner;
        let config = &inner.config;
        let job_id = job.job_id.as_str();
        let source = job.source.as_path();
        let ctx = self.tool_context(job_id);

        inner
            .progress
            .transition(job_id, JobUpdate::stage(JobStage::Metadata))
            .await?;
        let metadata = retry_stage(
            &config.retry,
            &inner.shutdown,
            job_id,
            JobStage::Metadata,
            |_| inner.toolkit.probe(&ctx, source),
        )
        .await?;

        let presets = QualityPreset::applicable(&config.presets, metadata.resolution.height);
        let labels: Vec<String> = presets.iter().map(QualityPreset::label).collect();
        debug!(renditions = ?labels, source = %metadata.resolution, "Planned renditions");

        inner
            .progress
            .transition(job_id, JobUpdate::stage(JobStage::Transcoding))
            .await?;
        let output = retry_stage(
            &config.retry,
            &inner.shutdown,
            job_id,
            JobStage::Transcoding,
            |attempt| self.transcode(&ctx, source, &metadata, &presets, attempt),
        )
        .await?;

        inner
            .progress
            .transition(job_id, JobUpdate::stage(JobStage::Cleanup))
            .await?;
        let manifest_path = retry_stage(
            &config.retry,
            &inner.shutdown,
            job_id,
            JobStage::Cleanup,
            |_| self.write_manifest(job_id, &output.renditions),
        )
        .await?;

        let done = inner
            .progress
            .transition(
                job_id,
                JobUpdate {
                    renditions: Some(output.renditions.iter().map(|r| r.label.clone()).collect()),
                    manifest_path: Some(manifest_path),
                    hls_url: Some(config.hls_url(job_id)),
                    thumbnail_path: Some(output.thumbnail.clone()),
                    thumbnail_url: Some(config.thumbnail_url(job_id)),
                    duration: Some(metadata.duration),
                    resolution: Some(metadata.resolution),
                    ..JobUpdate::stage(JobStage::Ready)
                },
            )
            .await?;

        remove_source(job_id, source).await;
        Ok(done)
    }

    /// One attempt of the transcoding stage: every rendition and the
    /// thumbnail concurrently, all or nothing.
    async fn transcode(
        &self,
        ctx: &ToolContext,
        source: &Path,
        metadata: &VideoMetadata,
        presets: &[QualityPreset],
        attempt: u32,
    ) -> Result<TranscodeOutput> {
        let inner = &self.inner;
        let config = &inner.config;
        let job_id = ctx.job_id.as_str();
        let output_dir = config.job_hls_dir(job_id);

        // Start every attempt from an empty directory.
        remove_dir_if_exists(&output_dir).await?;
        tokio::fs::create_dir_all(&output_dir).await?;
        inner
            .progress
            .track_renditions(job_id, presets.iter().map(QualityPreset::label).collect())
            .await;
        debug!(attempt, output_dir = %output_dir.display(), "Transcoding");

        let encodes = presets.iter().map(|preset| {
            let request = RenditionRequest {
                source: source.to_path_buf(),
                output_dir: output_dir.clone(),
                preset: preset.clone(),
                metadata: metadata.clone(),
            };
            let progress = inner.progress.clone();
            let id = job_id.to_string();
            let label = preset.label();
            let on_progress: ProgressFn =
                Arc::new(move |percent| progress.report_rendition(&id, &label, percent));
            async move {
                inner
                    .toolkit
                    .encode_rendition(ctx, &request, on_progress)
                    .await
            }
        });

        let thumbnail_request = ThumbnailRequest {
            source: source.to_path_buf(),
            output_path: config.thumbnail_path(job_id),
            width: config.thumbnail.width,
            height: config.thumbnail.height,
            position_secs: thumbnail_position(config.thumbnail.offset_secs, metadata.duration),
            quality: config.thumbnail.quality,
        };

        let (renditions, thumbnail) = tokio::try_join!(
            try_join_all(encodes),
            inner.toolkit.extract_thumbnail(ctx, &thumbnail_request)
        )?;

        if renditions.is_empty() {
            return Err(Error::Encode("no renditions were produced".to_string()));
        }
        Ok(TranscodeOutput {
            renditions,
            thumbnail,
        })
    }

    async fn write_manifest(
        &self,
        job_id: &str,
        renditions: &[RenditionOutput],
    ) -> Result<PathBuf> {
        let entries: Vec<ManifestEntry> = renditions
            .iter()
            .map(|r| ManifestEntry {
                label: r.label.clone(),
                resolution: r.resolution,
                bitrate_kbps: r.bitrate_kbps,
                playlist: r.playlist_name(),
            })
            .collect();
        let path = self.inner.config.manifest_path(job_id);
        tokio::fs::write(&path, build_master_playlist(&entries)).await?;
        debug!(path = %path.display(), variants = entries.len(), "Master playlist written");
        Ok(path)
    }

    /// Persist the failure, then drop the source and partial output.
    async fn fail_job(&self, job_id: &str, source: &Path, err: &Error) {
        error!(job_id, error = %err, "Job failed");

        if let Err(e) = self
            .inner
            .progress
            .transition(job_id, JobUpdate::failed(err.to_string()))
            .await
        {
            error!(job_id, error = %e, "Failed to mark job as failed");
        }

        remove_source(job_id, source).await;
        self.remove_partial_output(job_id).await;
    }

    async fn remove_partial_output(&self, job_id: &str) {
        let config = &self.inner.config;
        if let Err(e) = remove_dir_if_exists(&config.job_hls_dir(job_id)).await {
            warn!(job_id, error = %e, "Failed to remove partial HLS output");
        }
        if let Err(e) = remove_file_if_exists(&config.thumbnail_path(job_id)).await {
            warn!(job_id, error = %e, "Failed to remove partial thumbnail");
        }
    }

    fn tool_context(&self, job_id: &str) -> ToolContext {
        ToolContext {
            job_id: job_id.to_string(),
            registry: self.inner.registry.clone(),
            permits: self.inner.permits.clone(),
            shutdown: self.inner.shutdown.clone(),
            timeout: self.inner.config.process_timeout(),
        }
    }
}

async fn remove_source(job_id: &str, source: &Path) {
    match remove_file_if_exists(source).await {
        Ok(true) => debug!(job_id, path = %source.display(), "Source removed"),
        Ok(false) => {}
        Err(e) => warn!(job_id, path = %source.display(), error = %e, "Failed to remove source"),
    }
}

async fn remove_file_if_exists(path: &Path) -> std::io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

async fn remove_dir_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
