//! Job registry: the single source of truth for jobs and their state.

use std::sync::Arc;

use {tokio::sync::Mutex, tracing::info};

use crate::{
    Error, Result,
    clock::Clock,
    store::SchedulerStore,
    types::{Job, JobFilter, JobStatus},
};

pub struct JobRegistry {
    store: Arc<dyn SchedulerStore>,
    clock: Arc<dyn Clock>,
    history_limit: usize,
    /// Held across every read-modify-write of a job document.
    write_lock: Mutex<()>,
}

impl JobRegistry {
    pub fn new(store: Arc<dyn SchedulerStore>, clock: Arc<dyn Clock>, history_limit: usize) -> Self {
        Self {
            store,
            clock,
            history_limit: history_limit.max(1),
            write_lock: Mutex::new(()),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Create the job if unknown. Idempotent.
    ///
    /// `load_error` is the handler's load failure, if any: the job is then
    /// kept disabled with the message as `disabled_reason`. A job disabled
    /// for that reason is re-enabled once its handler loads again; a job
    /// disabled by an operator stays disabled.
    pub async fn register(
        &self,
        name: &str,
        description: Option<String>,
        load_error: Option<String>,
    ) -> Result<Job> {
        if name.trim().is_empty() {
            return Err(Error::validation("job name is required"));
        }

        let _guard = self.write_lock.lock().await;
        let now = self.now_ms();
        let existing = self.store.get_job(name).await?;
        let created = existing.is_none();
        let mut job = existing.unwrap_or_else(|| Job::new(name, description.clone(), now));

        if description.is_some() {
            job.description = description;
        }
        match load_error {
            Some(reason) => {
                job.enabled = false;
                job.disabled_reason = Some(reason);
            },
            None if job.disabled_reason.is_some() => {
                job.enabled = true;
                job.disabled_reason = None;
            },
            None => {},
        }
        job.updated_at_ms = now;
        self.store.save_job(&job).await?;

        if created {
            info!(job = %job.name, enabled = job.enabled, "job registered");
        }
        Ok(job)
    }

    pub async fn list(&self) -> Result<Vec<Job>> {
        self.store.load_jobs(JobFilter::default()).await
    }

    /// Enabled jobs in persisted order.
    pub async fn list_enabled(&self) -> Result<Vec<Job>> {
        self.store.load_jobs(JobFilter::enabled()).await
    }

    /// Jobs waiting for the dispatcher.
    pub async fn list_requested(&self) -> Result<Vec<Job>> {
        self.store
            .load_jobs(JobFilter {
                status: Some(JobStatus::Requested),
                enabled: Some(true),
            })
            .await
    }

    pub async fn get(&self, name: &str) -> Result<Job> {
        self.store
            .get_job(name)
            .await?
            .ok_or_else(|| Error::job_not_found(name))
    }

    /// Idle to Requested. The run id is allocated now and reused by `begin`.
    pub async fn request_run(&self, name: &str) -> Result<Job> {
        let (job, ()) = self
            .mutate(name, |job, now| {
                if !job.enabled {
                    return Err(Error::invalid_transition(
                        &job.name,
                        job.status,
                        "request disabled",
                    ));
                }
                if job.status != JobStatus::Idle {
                    return Err(Error::invalid_transition(&job.name, job.status, "request"));
                }
                job.status = JobStatus::Requested;
                job.requested_run_id = Some(uuid::Uuid::new_v4().to_string());
                job.requested_at_ms = Some(now);
                Ok(())
            })
            .await?;
        info!(
            job = %job.name,
            run_id = job.requested_run_id.as_deref().unwrap_or_default(),
            "run requested"
        );
        Ok(job)
    }

    /// Disabling a requested job withdraws the request.
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<Job> {
        let (job, ()) = self
            .mutate(name, |job, _| {
                if enabled {
                    if let Some(reason) = &job.disabled_reason {
                        return Err(Error::validation(format!(
                            "handler for {} failed to load: {reason}",
                            job.name
                        )));
                    }
                } else if job.status == JobStatus::Requested {
                    job.status = JobStatus::Idle;
                    job.requested_run_id = None;
                    job.requested_at_ms = None;
                }
                job.enabled = enabled;
                Ok(())
            })
            .await?;
        info!(job = %job.name, enabled, "job toggled");
        Ok(job)
    }

    /// Delete an idle job and its history. A job whose handler is still
    /// registered comes back, empty, on the next discovery.
    pub async fn remove(&self, name: &str) -> Result<Job> {
        let _guard = self.write_lock.lock().await;
        let job = self
            .store
            .get_job(name)
            .await?
            .ok_or_else(|| Error::job_not_found(name))?;
        if job.status != JobStatus::Idle {
            return Err(Error::invalid_transition(&job.name, job.status, "remove"));
        }
        self.store.delete_job(name).await?;
        info!(job = %job.name, runs = job.run_count, "job removed");
        Ok(job)
    }

    /// Atomic read-modify-write of one job. Nothing is saved if `f` fails.
    pub(crate) async fn mutate<R, F>(&self, name: &str, f: F) -> Result<(Job, R)>
    where
        F: FnOnce(&mut Job, u64) -> Result<R>,
    {
        let _guard = self.write_lock.lock().await;
        let mut job = self
            .store
            .get_job(name)
            .await?
            .ok_or_else(|| Error::job_not_found(name))?;
        let now = self.now_ms();
        let out = f(&mut job, now)?;
        job.updated_at_ms = now;
        job.trim_history(self.history_limit);
        self.store.save_job(&job).await?;
        Ok((job, out))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{clock::ManualClock, store_memory::InMemoryStore},
    };

    fn make_registry() -> JobRegistry {
        JobRegistry::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(ManualClock::new(1_000)),
            100,
        )
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let registry = make_registry();
        let first = registry.register("syncX", None, None).await.unwrap();
        assert_eq!(first.status, JobStatus::Idle);
        assert!(first.enabled);

        registry.request_run("syncX").await.unwrap();
        let again = registry.register("syncX", None, None).await.unwrap();
        assert_eq!(again.status, JobStatus::Requested);
        assert_eq!(registry.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn load_failure_registers_disabled() {
        let registry = make_registry();
        let job = registry
            .register("broken", None, Some("module not found".into()))
            .await
            .unwrap();
        assert!(!job.enabled);
        assert_eq!(job.disabled_reason.as_deref(), Some("module not found"));
        assert!(registry.list_enabled().await.unwrap().is_empty());

        let err = registry.set_enabled("broken", true).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));

        // Handler loads on the next discovery.
        let job = registry.register("broken", None, None).await.unwrap();
        assert!(job.enabled);
        assert!(job.disabled_reason.is_none());
    }

    #[tokio::test]
    async fn operator_disable_survives_registration() {
        let registry = make_registry();
        registry.register("syncX", None, None).await.unwrap();
        registry.set_enabled("syncX", false).await.unwrap();
        let job = registry.register("syncX", None, None).await.unwrap();
        assert!(!job.enabled);
    }

    #[tokio::test]
    async fn remove_only_idle_jobs() {
        let registry = make_registry();
        registry.register("syncX", None, None).await.unwrap();
        registry.request_run("syncX").await.unwrap();
        let err = registry.remove("syncX").await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition {
            from: JobStatus::Requested,
            ..
        }));

        registry.set_enabled("syncX", false).await.unwrap();
        registry.remove("syncX").await.unwrap();
        assert!(registry.list().await.unwrap().is_empty());
        assert!(matches!(
            registry.remove("syncX").await.unwrap_err(),
            Error::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn get_unknown_job() {
        let registry = make_registry();
        let err = registry.get("nope").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "job", .. }));
        assert!(registry.request_run("nope").await.is_err());
    }

    #[tokio::test]
    async fn request_run_allocates_run_id() {
        let registry = make_registry();
        registry.register("syncX", None, None).await.unwrap();
        let job = registry.request_run("syncX").await.unwrap();
        assert_eq!(job.status, JobStatus::Requested);
        assert!(job.requested_run_id.is_some());
        assert_eq!(job.requested_at_ms, Some(1_000));
        assert_eq!(registry.list_requested().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_request_is_rejected() {
        let registry = make_registry();
        registry.register("syncX", None, None).await.unwrap();
        registry.request_run("syncX").await.unwrap();
        let err = registry.request_run("syncX").await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition {
            from: JobStatus::Requested,
            ..
        }));
    }

    #[tokio::test]
    async fn disabled_job_cannot_be_requested() {
        let registry = make_registry();
        registry.register("syncX", None, None).await.unwrap();
        registry.set_enabled("syncX", false).await.unwrap();
        let err = registry.request_run("syncX").await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn disabling_withdraws_request() {
        let registry = make_registry();
        registry.register("syncX", None, None).await.unwrap();
        registry.request_run("syncX").await.unwrap();
        let job = registry.set_enabled("syncX", false).await.unwrap();
        assert_eq!(job.status, JobStatus::Idle);
        assert!(job.requested_run_id.is_none());
        assert!(registry.list_requested().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn blank_name_is_rejected() {
        let registry = make_registry();
        assert!(matches!(
            registry.register("  ", None, None).await.unwrap_err(),
            Error::Validation { .. }
        ));
    }
}
