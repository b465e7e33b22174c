//! JSON file-backed store with atomic writes.

use std::path::{Path, PathBuf};

use {
    async_trait::async_trait,
    serde::{Serialize, de::DeserializeOwned},
    tokio::{fs, sync::Mutex},
};

use crate::{
    Context, Error, Result,
    store::SchedulerStore,
    types::{BatchConfig, Job, JobFilter},
};

/// `jobs.json` and `batches.json` in one directory, each a JSON array.
pub struct FileStore {
    jobs_path: PathBuf,
    batches_path: PathBuf,
    /// Serializes read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            jobs_path: dir.join("jobs.json"),
            batches_path: dir.join("batches.json"),
            write_lock: Mutex::new(()),
        }
    }

    async fn read_all<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let data = fs::read_to_string(path).await?;
        if data.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&data).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Write to a temp file, keep the previous version as `.bak`, rename over.
    async fn write_all<T: Serialize>(path: &Path, docs: &[T]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(docs)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json.as_bytes()).await?;

        if fs::try_exists(path).await.unwrap_or(false) {
            let bak = path.with_extension("json.bak");
            let _ = fs::copy(path, &bak).await;
        }

        fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl SchedulerStore for FileStore {
    async fn load_jobs(&self, filter: JobFilter) -> Result<Vec<Job>> {
        let jobs: Vec<Job> = Self::read_all(&self.jobs_path).await?;
        Ok(jobs.into_iter().filter(|j| filter.matches(j)).collect())
    }

    async fn get_job(&self, name: &str) -> Result<Option<Job>> {
        let jobs: Vec<Job> = Self::read_all(&self.jobs_path).await?;
        Ok(jobs.into_iter().find(|j| j.name == name))
    }

    async fn save_job(&self, job: &Job) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut jobs: Vec<Job> = Self::read_all(&self.jobs_path).await?;
        match jobs.iter_mut().find(|j| j.name == job.name) {
            Some(existing) => *existing = job.clone(),
            None => jobs.push(job.clone()),
        }
        Self::write_all(&self.jobs_path, &jobs).await
    }

    async fn delete_job(&self, name: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut jobs: Vec<Job> = Self::read_all(&self.jobs_path).await?;
        let before = jobs.len();
        jobs.retain(|j| j.name != name);
        if jobs.len() == before {
            return Err(Error::job_not_found(name));
        }
        Self::write_all(&self.jobs_path, &jobs).await
    }

    async fn load_batches(&self) -> Result<Vec<BatchConfig>> {
        Self::read_all(&self.batches_path).await
    }

    async fn get_batch(&self, name: &str) -> Result<Option<BatchConfig>> {
        let batches: Vec<BatchConfig> = Self::read_all(&self.batches_path).await?;
        Ok(batches.into_iter().find(|b| b.name == name))
    }

    async fn insert_batch(&self, batch: &BatchConfig) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut batches: Vec<BatchConfig> = Self::read_all(&self.batches_path).await?;
        if batches.iter().any(|b| b.name == batch.name) {
            return Err(Error::already_exists("batch", &batch.name));
        }
        batches.push(batch.clone());
        Self::write_all(&self.batches_path, &batches).await
    }

    async fn update_batch(&self, batch: &BatchConfig) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut batches: Vec<BatchConfig> = Self::read_all(&self.batches_path).await?;
        let existing = batches
            .iter_mut()
            .find(|b| b.name == batch.name)
            .ok_or_else(|| Error::batch_not_found(&batch.name))?;
        *existing = batch.clone();
        Self::write_all(&self.batches_path, &batches).await
    }

    async fn delete_batch(&self, name: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut batches: Vec<BatchConfig> = Self::read_all(&self.batches_path).await?;
        let before = batches.len();
        batches.retain(|b| b.name != name);
        if batches.len() == before {
            return Err(Error::batch_not_found(name));
        }
        Self::write_all(&self.batches_path, &batches).await
    }
}
