//! FIFO admission queue with a bounded number of active jobs.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::time::Instant;

use parking_lot::Mutex;
use thiserror::Error;

/// A job waiting for, or holding, a worker slot.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub job_id: String,
    pub source: PathBuf,
    pub enqueued_at: Instant,
}

impl QueuedJob {
    pub fn new(job_id: impl Into<String>, source: impl Into<PathBuf>) -> Self {
        Self {
            job_id: job_id.into(),
            source: source.into(),
            enqueued_at: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnqueueError {
    #[error("job {0} is already queued or running")]
    Duplicate(String),
    #[error("queue is closed")]
    Closed,
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdmissionStats {
    pub active: usize,
    pub queued: usize,
    pub peak_active: usize,
}

#[derive(Debug, Default)]
struct State {
    pending: VecDeque<QueuedJob>,
    active: HashSet<String>,
    peak_active: usize,
    closed: bool,
}

/// Pending queue and active set under one lock.
#[derive(Debug)]
pub struct AdmissionQueue {
    state: Mutex<State>,
    max_concurrent: usize,
}

impl AdmissionQueue {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Whether `job_id` is pending or active.
    pub fn contains(&self, job_id: &str) -> bool {
        let state = self.state.lock();
        state.active.contains(job_id) || state.pending.iter().any(|j| j.job_id == job_id)
    }

    pub fn enqueue(&self, job: QueuedJob) -> Result<(), EnqueueError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(EnqueueError::Closed);
        }
        if state.active.contains(&job.job_id)
            || state.pending.iter().any(|j| j.job_id == job.job_id)
        {
            return Err(EnqueueError::Duplicate(job.job_id));
        }
        state.pending.push_back(job);
        Ok(())
    }

    /// Whether a pending job would be admitted right now.
    pub fn can_admit(&self) -> bool {
        let state = self.state.lock();
        !state.closed && !state.pending.is_empty() && state.active.len() < self.max_concurrent
    }

    /// Pop the oldest pending job into the active set if a slot is free.
    pub fn try_admit(&self) -> Option<QueuedJob> {
        let mut state = self.state.lock();
        if state.closed || state.active.len() >= self.max_concurrent {
            return None;
        }
        let job = state.pending.pop_front()?;
        state.active.insert(job.job_id.clone());
        state.peak_active = state.peak_active.max(state.active.len());
        Some(job)
    }

    /// Release the slot held by `job_id`.
    pub fn complete(&self, job_id: &str) -> bool {
        self.state.lock().active.remove(job_id)
    }

    /// Refuse further work and hand back everything still pending.
    pub fn close(&self) -> Vec<QueuedJob> {
        let mut state = self.state.lock();
        state.closed = true;
        state.pending.drain(..).collect()
    }

    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().active.iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn stats(&self) -> AdmissionStats {
        let state = self.state.lock();
        AdmissionStats {
            active: state.active.len(),
            queued: state.pending.len(),
            peak_active: state.peak_active,
        }
    }
}
