//! SQLite-backed store using sqlx. Each row holds one JSON document.

use {
    async_trait::async_trait,
    sqlx::{Row, SqlitePool, sqlite::SqlitePoolOptions},
};

use crate::{
    Context, Error, Result,
    store::SchedulerStore,
    types::{BatchConfig, Job, JobFilter},
};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect and run migrations.
    pub async fn new(database_url: &str) -> Result<Self> {
        // Every connection to `:memory:` is a separate database.
        let max_connections = if database_url.contains(":memory:") {
            1
        } else {
            5
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("failed to connect to SQLite")?;

        crate::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    /// Use an existing pool. Call [`crate::run_migrations`] first.
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SchedulerStore for SqliteStore {
    async fn load_jobs(&self, filter: JobFilter) -> Result<Vec<Job>> {
        let rows = sqlx::query("SELECT data FROM jobs ORDER BY rowid")
            .fetch_all(&self.pool)
            .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let data: String = row.get("data");
            let job: Job = serde_json::from_str(&data)?;
            if filter.matches(&job) {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn get_job(&self, name: &str) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT data FROM jobs WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| serde_json::from_str(&r.get::<String, _>("data")))
            .transpose()
            .map_err(Into::into)
    }

    async fn save_job(&self, job: &Job) -> Result<()> {
        let data = serde_json::to_string(job)?;
        sqlx::query(
            "INSERT INTO jobs (name, data) VALUES (?, ?)
             ON CONFLICT(name) DO UPDATE SET data = excluded.data",
        )
        .bind(&job.name)
        .bind(&data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_job(&self, name: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM jobs WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::job_not_found(name));
        }
        Ok(())
    }

    async fn load_batches(&self) -> Result<Vec<BatchConfig>> {
        let rows = sqlx::query("SELECT data FROM batches ORDER BY rowid")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| serde_json::from_str(&r.get::<String, _>("data")).map_err(Into::into))
            .collect()
    }

    async fn get_batch(&self, name: &str) -> Result<Option<BatchConfig>> {
        let row = sqlx::query("SELECT data FROM batches WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| serde_json::from_str(&r.get::<String, _>("data")))
            .transpose()
            .map_err(Into::into)
    }

    async fn insert_batch(&self, batch: &BatchConfig) -> Result<()> {
        let data = serde_json::to_string(batch)?;
        let result = sqlx::query(
            "INSERT INTO batches (name, data) VALUES (?, ?) ON CONFLICT(name) DO NOTHING",
        )
        .bind(&batch.name)
        .bind(&data)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::already_exists("batch", &batch.name));
        }
        Ok(())
    }

    async fn update_batch(&self, batch: &BatchConfig) -> Result<()> {
        let data = serde_json::to_string(batch)?;
        let result = sqlx::query("UPDATE batches SET data = ? WHERE name = ?")
            .bind(&data)
            .bind(&batch.name)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::batch_not_found(&batch.name));
        }
        Ok(())
    }

    async fn delete_batch(&self, name: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM batches WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::batch_not_found(name));
        }
        Ok(())
    }
}
