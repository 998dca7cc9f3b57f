//! Job record storage.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::domain::{Job, JobUpdate};
use crate::{Error, Result};

/// Key-value store of job records.
///
/// Each call is atomic for the job it touches.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Job>;

    /// Validate and apply `update`, returning the updated record.
    async fn update(&self, id: &str, update: JobUpdate) -> Result<Job>;
}

/// In-process store backed by a concurrent map.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: DashMap<String, Job>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new record. Fails if the id is taken.
    pub fn create(&self, job: Job) -> Result<()> {
        match self.jobs.entry(job.id.clone()) {
            Entry::Occupied(_) => Err(Error::Other(format!("job {} already exists", job.id))),
            Entry::Vacant(slot) => {
                slot.insert(job);
                Ok(())
            }
        }
    }

    /// Insert or replace a record.
    pub fn insert(&self, job: Job) {
        self.jobs.insert(job.id.clone(), job);
    }

    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.iter().map(|e| e.value().clone()).collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn get(&self, id: &str) -> Result<Job> {
        self.jobs
            .get(id)
            .map(|job| job.value().clone())
            .ok_or_else(|| Error::not_found("Job", id))
    }

    async fn update(&self, id: &str, update: JobUpdate) -> Result<Job> {
        let mut job = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| Error::not_found("Job", id))?;
        job.try_apply(update)?;
        Ok(job.clone())
    }
}
