//! Persistence trait for jobs and batch configs.

use std::sync::Arc;

use {async_trait::async_trait, synchro_config::StorageConfig, tracing::info};

use crate::{
    Result,
    store_file::FileStore,
    store_memory::InMemoryStore,
    store_sqlite::SqliteStore,
    types::{BatchConfig, Job, JobFilter},
};

/// Document-style backend for the two collections. No transaction spans both.
///
/// Listings come back in insertion order.
#[async_trait]
pub trait SchedulerStore: Send + Sync {
    async fn load_jobs(&self, filter: JobFilter) -> Result<Vec<Job>>;
    async fn get_job(&self, name: &str) -> Result<Option<Job>>;
    /// Insert or replace by name.
    async fn save_job(&self, job: &Job) -> Result<()>;
    async fn delete_job(&self, name: &str) -> Result<()>;

    async fn load_batches(&self) -> Result<Vec<BatchConfig>>;
    async fn get_batch(&self, name: &str) -> Result<Option<BatchConfig>>;
    /// Fails with `AlreadyExists` if the name is taken.
    async fn insert_batch(&self, batch: &BatchConfig) -> Result<()>;
    /// Fails with `NotFound` if the name is unknown.
    async fn update_batch(&self, batch: &BatchConfig) -> Result<()>;
    async fn delete_batch(&self, name: &str) -> Result<()>;
}

/// Open the backend selected in the config.
pub async fn open_store(config: &StorageConfig) -> Result<Arc<dyn SchedulerStore>> {
    use synchro_config::StorageBackend;

    match config.backend {
        StorageBackend::Memory => {
            info!(backend = "memory", "opening scheduler store");
            Ok(Arc::new(InMemoryStore::new()))
        },
        StorageBackend::File => {
            let dir = config
                .path
                .clone()
                .unwrap_or_else(synchro_config::data_dir);
            info!(backend = "file", path = %dir.display(), "opening scheduler store");
            Ok(Arc::new(FileStore::new(dir)))
        },
        StorageBackend::Sqlite => {
            let url = match &config.database_url {
                Some(url) => url.clone(),
                None => {
                    let dir = synchro_config::data_dir();
                    tokio::fs::create_dir_all(&dir).await?;
                    format!("sqlite://{}?mode=rwc", dir.join("synchro.db").display())
                },
            };
            info!(backend = "sqlite", url = %url, "opening scheduler store");
            Ok(Arc::new(SqliteStore::new(&url).await?))
        },
    }
}
