//! In-memory store for tests and throwaway runs.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::{
    Error, Result,
    store::SchedulerStore,
    types::{BatchConfig, Job, JobFilter},
};

/// Vec-backed so listings keep insertion order. Nothing survives a restart.
#[derive(Default)]
pub struct InMemoryStore {
    jobs: Mutex<Vec<Job>>,
    batches: Mutex<Vec<BatchConfig>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SchedulerStore for InMemoryStore {
    async fn load_jobs(&self, filter: JobFilter) -> Result<Vec<Job>> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        Ok(jobs.iter().filter(|j| filter.matches(j)).cloned().collect())
    }

    async fn get_job(&self, name: &str) -> Result<Option<Job>> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        Ok(jobs.iter().find(|j| j.name == name).cloned())
    }

    async fn save_job(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        match jobs.iter_mut().find(|j| j.name == job.name) {
            Some(existing) => *existing = job.clone(),
            None => jobs.push(job.clone()),
        }
        Ok(())
    }

    async fn delete_job(&self, name: &str) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let before = jobs.len();
        jobs.retain(|j| j.name != name);
        if jobs.len() == before {
            return Err(Error::job_not_found(name));
        }
        Ok(())
    }

    async fn load_batches(&self) -> Result<Vec<BatchConfig>> {
        let batches = self.batches.lock().unwrap_or_else(|e| e.into_inner());
        Ok(batches.clone())
    }

    async fn get_batch(&self, name: &str) -> Result<Option<BatchConfig>> {
        let batches = self.batches.lock().unwrap_or_else(|e| e.into_inner());
        Ok(batches.iter().find(|b| b.name == name).cloned())
    }

    async fn insert_batch(&self, batch: &BatchConfig) -> Result<()> {
        let mut batches = self.batches.lock().unwrap_or_else(|e| e.into_inner());
        if batches.iter().any(|b| b.name == batch.name) {
            return Err(Error::already_exists("batch", &batch.name));
        }
        batches.push(batch.clone());
        Ok(())
    }

    async fn update_batch(&self, batch: &BatchConfig) -> Result<()> {
        let mut batches = self.batches.lock().unwrap_or_else(|e| e.into_inner());
        let existing = batches
            .iter_mut()
            .find(|b| b.name == batch.name)
            .ok_or_else(|| Error::batch_not_found(&batch.name))?;
        *existing = batch.clone();
        Ok(())
    }

    async fn delete_batch(&self, name: &str) -> Result<()> {
        let mut batches = self.batches.lock().unwrap_or_else(|e| e.into_inner());
        let before = batches.len();
        batches.retain(|b| b.name != name);
        if batches.len() == before {
            return Err(Error::batch_not_found(name));
        }
        Ok(())
    }
}
