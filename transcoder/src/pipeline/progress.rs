//! Single-writer progress aggregation.
//!
//! Every stage change and every encoder progress report for every job flows
//! through one consumer task. Stage changes are persisted (stage and
//! progress in one store call) and acknowledged to the sender; encoder
//! reports are folded into an advisory percentage that is broadcast but
//! never persisted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::broadcast::{Broadcaster, ProgressDetails};
use crate::domain::{Job, JobStage, JobStatus, JobUpdate};
use crate::store::JobStore;
use crate::{Error, Result};

/// Capacity of the aggregator's inbox.
const CHANNEL_CAPACITY: usize = 1024;

/// Progress window covered by the transcoding stage.
const TRANSCODE_START: f64 = 10.0;
const TRANSCODE_END: f64 = 90.0;

enum ProgressMessage {
    Transition {
        job_id: String,
        update: JobUpdate,
        ack: oneshot::Sender<Result<Job>>,
    },
    Track {
        job_id: String,
        renditions: Vec<String>,
    },
    Rendition {
        job_id: String,
        label: String,
        percent: f64,
    },
    Forget {
        job_id: String,
    },
}

/// Sending side of the aggregator. Cheap to clone.
#[derive(Clone)]
pub struct ProgressHandle {
    tx: mpsc::Sender<ProgressMessage>,
}

impl ProgressHandle {
    /// Persist a stage change and wait until it is written.
    pub async fn transition(&self, job_id: &str, update: JobUpdate) -> Result<Job> {
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(ProgressMessage::Transition {
                job_id: job_id.to_string(),
                update,
                ack,
            })
            .await
            .map_err(|_| Error::Other("progress aggregator stopped".to_string()))?;
        rx.await
            .map_err(|_| Error::Other("progress aggregator dropped the update".to_string()))?
    }

    /// Declare the renditions whose progress makes up the transcoding stage.
    ///
    /// Resets any progress previously reported for the job.
    pub async fn track_renditions(&self, job_id: &str, renditions: Vec<String>) {
        let _ = self
            .tx
            .send(ProgressMessage::Track {
                job_id: job_id.to_string(),
                renditions,
            })
            .await;
    }

    /// Advisory encoder progress. Dropped when the aggregator is busy.
    pub fn report_rendition(&self, job_id: &str, label: &str, percent: f64) {
        let _ = self.tx.try_send(ProgressMessage::Rendition {
            job_id: job_id.to_string(),
            label: label.to_string(),
            percent,
        });
    }

    /// Release the aggregator's bookkeeping for a job.
    pub async fn forget(&self, job_id: &str) {
        let _ = self
            .tx
            .send(ProgressMessage::Forget {
                job_id: job_id.to_string(),
            })
            .await;
    }
}

#[derive(Debug)]
struct JobProgress {
    started: Instant,
    stage: JobStage,
    renditions: Vec<String>,
    percents: HashMap<String, f64>,
    last_broadcast: u8,
}

impl JobProgress {
    fn new(stage: JobStage, progress: u8) -> Self {
        Self {
            started: Instant::now(),
            stage,
            renditions: Vec::new(),
            percents: HashMap::new(),
            last_broadcast: progress,
        }
    }

    /// Mean rendition progress mapped into the transcoding window.
    fn transcode_percent(&self) -> f64 {
        if self.renditions.is_empty() {
            return TRANSCODE_START;
        }
        let total: f64 = self
            .renditions
            .iter()
            .map(|label| self.percents.get(label).copied().unwrap_or(0.0))
            .sum();
        let mean = (total / self.renditions.len() as f64).clamp(0.0, 100.0);
        TRANSCODE_START + mean / 100.0 * (TRANSCODE_END - TRANSCODE_START)
    }
}

/// Seconds left, extrapolated from the time taken to reach `percent`.
pub fn estimate_eta_secs(elapsed_secs: f64, percent: f64) -> Option<u64> {
    if !(percent > 0.0 && percent < 100.0) || !elapsed_secs.is_finite() {
        return None;
    }
    let fraction = percent / 100.0;
    Some((elapsed_secs / fraction - elapsed_secs).max(0.0).round() as u64)
}

/// Start the aggregator. It stops once every [`ProgressHandle`] is dropped.
pub fn spawn_progress_aggregator(
    store: Arc<dyn JobStore>,
    broadcaster: Arc<dyn Broadcaster>,
) -> (ProgressHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<ProgressMessage>(CHANNEL_CAPACITY);

    let task = tokio::spawn(async move {
        let mut jobs: HashMap<String, JobProgress> = HashMap::new();

        while let Some(message) = rx.recv().await {
            match message {
                ProgressMessage::Transition {
                    job_id,
                    update,
                    ack,
                } => {
                    let result =
                        apply_transition(&*store, &*broadcaster, &mut jobs, &job_id, update).await;
                    let _ = ack.send(result);
                }
                ProgressMessage::Track { job_id, renditions } => {
                    if let Some(state) = jobs.get_mut(&job_id) {
                        state.renditions = renditions;
                        state.percents.clear();
                    }
                }
                ProgressMessage::Rendition {
                    job_id,
                    label,
                    percent,
                } => {
                    let Some(state) = jobs.get_mut(&job_id) else {
                        continue;
                    };
                    if state.stage != JobStage::Transcoding {
                        continue;
                    }
                    let entry = state.percents.entry(label.clone()).or_insert(0.0);
                    *entry = entry.max(percent.clamp(0.0, 100.0));

                    let overall =
                        (state.transcode_percent().floor() as u8).max(state.last_broadcast);
                    let eta_secs =
                        estimate_eta_secs(state.started.elapsed().as_secs_f64(), overall as f64);
                    state.last_broadcast = overall;

                    broadcaster.broadcast_progress(
                        &job_id,
                        overall,
                        JobStage::Transcoding,
                        ProgressDetails {
                            current_task: Some(format!(
                                "{} variant ({}%)",
                                label,
                                percent.round() as u32
                            )),
                            eta_secs,
                            error: None,
                        },
                    );
                }
                ProgressMessage::Forget { job_id } => {
                    jobs.remove(&job_id);
                }
            }
        }
        debug!("Progress aggregator stopped");
    });

    (ProgressHandle { tx }, task)
}

async fn apply_transition(
    store: &dyn JobStore,
    broadcaster: &dyn Broadcaster,
    jobs: &mut HashMap<String, JobProgress>,
    job_id: &str,
    update: JobUpdate,
) -> Result<Job> {
    let error = update.error.clone();
    let job = match store.update(job_id, update).await {
        Ok(job) => job,
        Err(e) => {
            warn!(job_id, error = %e, "Rejected job update");
            return Err(e);
        }
    };

    let state = jobs
        .entry(job_id.to_string())
        .or_insert_with(|| JobProgress::new(job.stage, job.progress));
    state.stage = job.stage;
    state.last_broadcast = state.last_broadcast.max(job.progress);

    let eta_secs = estimate_eta_secs(state.started.elapsed().as_secs_f64(), job.progress as f64);
    broadcaster.broadcast_progress(
        job_id,
        job.progress,
        job.stage,
        ProgressDetails {
            current_task: Some(job.stage.to_string()),
            eta_secs,
            error,
        },
    );

    match job.status {
        JobStatus::Ready | JobStatus::Failed => {
            broadcaster.broadcast_status(job_id, job.status);
            jobs.remove(job_id);
        }
        JobStatus::Processing if job.stage == JobStage::Initializing => {
            broadcaster.broadcast_status(job_id, job.status);
        }
        JobStatus::Processing => {}
    }

    Ok(job)
}
