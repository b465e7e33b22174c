//! The engine facade wired from configuration.
//!
//! `Scheduler` owns every component and the background loops. The HTTP
//! gateway and the CLI only talk to this type.

use std::{sync::Arc, time::Duration};

use {
    synchro_config::SchedulerConfig,
    tokio::{
        sync::{Mutex, watch},
        task::JoinHandle,
    },
    tracing::{error, info, warn},
};

use crate::{
    Error, Result,
    catalog::BatchCatalog,
    clock::{Clock, SystemClock},
    dispatcher::{Dispatcher, TickReport},
    executor::Executor,
    handler::{Discovered, HandlerRegistry},
    reaper::Reaper,
    registry::JobRegistry,
    runner::{BatchRunner, NotifyFn, RetryPolicy},
    schedule,
    state::JobStateMachine,
    stats,
    store::SchedulerStore,
    triggers::{ReloadReport, TriggerManager, TriggerStatus},
    types::{
        BatchConfig, BatchConfigCreate, BatchConfigPatch, BatchRunReport, DueBatch,
        ErrorRateEntry, Job, JobFilter, JobSummary, ReapReport, RunRecord, SchedulerStats,
        ScriptRef, ScriptRefPatch,
    },
};

/// `disabled_reason` of a stored job with no registered handler.
pub const MISSING_HANDLER: &str = "no handler registered";

struct Running {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct Scheduler {
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    store: Arc<dyn SchedulerStore>,
    handlers: Arc<HandlerRegistry>,
    registry: Arc<JobRegistry>,
    state: Arc<JobStateMachine>,
    dispatcher: Arc<Dispatcher>,
    catalog: Arc<BatchCatalog>,
    triggers: Arc<TriggerManager>,
    reaper: Arc<Reaper>,
    running: Mutex<Option<Running>>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn SchedulerStore>,
        handlers: HandlerRegistry,
        on_notify: Option<NotifyFn>,
    ) -> Self {
        Self::with_clock(config, store, handlers, Arc::new(SystemClock), on_notify)
    }

    pub fn with_clock(
        config: SchedulerConfig,
        store: Arc<dyn SchedulerStore>,
        handlers: HandlerRegistry,
        clock: Arc<dyn Clock>,
        on_notify: Option<NotifyFn>,
    ) -> Self {
        let handlers = Arc::new(handlers);
        let timeout = (config.default_timeout_secs > 0)
            .then(|| Duration::from_secs(config.default_timeout_secs));
        let retry = RetryPolicy {
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        };

        let registry = Arc::new(JobRegistry::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            config.history_limit,
        ));
        let state = Arc::new(JobStateMachine::new(Arc::clone(&registry)));
        let executor = Arc::new(Executor::new(Arc::clone(&state), Arc::clone(&handlers)));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&executor),
            timeout,
        ));
        let catalog = Arc::new(BatchCatalog::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            config.default_timezone.clone(),
        ));
        let runner = Arc::new(BatchRunner::new(
            Arc::clone(&registry),
            Arc::clone(&executor),
            Arc::clone(&clock),
            retry,
            timeout,
            on_notify,
        ));
        let triggers = Arc::new(TriggerManager::new(
            Arc::clone(&catalog),
            runner,
            Arc::clone(&clock),
        ));
        let reaper = Arc::new(Reaper::new(
            Arc::clone(&state),
            Duration::from_secs(config.stale_threshold_secs),
        ));

        Self {
            config,
            clock,
            store,
            handlers,
            registry,
            state,
            dispatcher,
            catalog,
            triggers,
            reaper,
            running: Mutex::new(None),
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Instantiate every handler and register its job. Load failures
    /// register the job disabled instead of failing.
    pub async fn discover(&self) -> Result<Vec<Discovered>> {
        let found = self.handlers.discover();
        for handler in &found {
            self.registry
                .register(&handler.name, handler.description.clone(), handler.error.clone())
                .await?;
        }
        let failed = found.iter().filter(|d| d.error.is_some()).count();

        // Stored jobs whose handler is gone stay listed, but disabled.
        let known = self.handlers.names();
        let mut orphaned = 0;
        for job in self.registry.list().await? {
            if known.contains(&job.name.as_str()) {
                continue;
            }
            self.registry
                .register(&job.name, None, Some(MISSING_HANDLER.to_string()))
                .await?;
            warn!(job = %job.name, "no handler registered, job disabled");
            orphaned += 1;
        }

        info!(handlers = found.len(), failed, orphaned, "handlers discovered");
        Ok(found)
    }

    /// Settings the background loops cannot run with.
    fn check_config(&self) -> Result<()> {
        if self.config.poll_interval_secs == 0 {
            return Err(Error::validation("scheduler.poll_interval_secs must be at least 1"));
        }
        if self.config.reaper_interval_secs == 0 {
            return Err(Error::validation("scheduler.reaper_interval_secs must be at least 1"));
        }
        Ok(())
    }

    /// Discover handlers, bind triggers and start the dispatcher and reaper loops.
    pub async fn start(&self) -> Result<ReloadReport> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(Error::message("scheduler is already running"));
        }

        self.check_config()?;
        self.discover().await?;
        let reload = self.triggers.reload().await?;
        for rejected in &reload.rejected {
            warn!(batch = %rejected.name, reason = %rejected.reason, "batch left unbound");
        }

        let (tx, rx) = watch::channel(false);
        let poll = Duration::from_secs(self.config.poll_interval_secs);
        let sweep = Duration::from_secs(self.config.reaper_interval_secs);
        let tasks = vec![
            tokio::spawn(Arc::clone(&self.dispatcher).run_loop(poll, rx.clone())),
            tokio::spawn(Arc::clone(&self.reaper).run_loop(sweep, rx)),
        ];
        *running = Some(Running {
            shutdown: tx,
            tasks,
        });

        info!(
            bound = reload.active.len(),
            poll_interval_secs = self.config.poll_interval_secs,
            reaper_interval_secs = self.config.reaper_interval_secs,
            "scheduler started"
        );
        Ok(reload)
    }

    /// Stop the loops and unbind all triggers. Runs in flight finish on their own.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        let _ = running.shutdown.send(true);
        for task in running.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "scheduler loop ended abnormally");
            }
        }
        self.triggers.shutdown().await;
        info!("scheduler stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    // ── Jobs ────────────────────────────────────────────────────────────

    /// Dashboard rows: jobs with their member batches and schedule description.
    pub async fn list_jobs(&self) -> Result<Vec<JobSummary>> {
        let jobs = self.registry.list().await?;
        let batches = self.catalog.list().await?;
        Ok(jobs.into_iter().map(|job| summarize(job, &batches)).collect())
    }

    pub async fn get_job(&self, name: &str) -> Result<JobSummary> {
        let job = self.registry.get(name).await?;
        let batches = self.catalog.list().await?;
        Ok(summarize(job, &batches))
    }

    pub async fn set_job_enabled(&self, name: &str, enabled: bool) -> Result<Job> {
        self.registry.set_enabled(name, enabled).await
    }

    /// Delete a job no batch refers to.
    pub async fn remove_job(&self, name: &str) -> Result<Job> {
        let batches = self.catalog.list().await?;
        let members: Vec<&str> = batches
            .iter()
            .filter(|b| b.scripts.iter().any(|s| s.job_name() == name))
            .map(|b| b.name.as_str())
            .collect();
        if !members.is_empty() {
            return Err(Error::validation(format!(
                "job {name} is still used by batch {}",
                members.join(", ")
            )));
        }
        self.registry.remove(name).await
    }

    pub async fn job_history(&self, name: &str, limit: usize) -> Result<Vec<RunRecord>> {
        self.state.history(name, limit).await
    }

    /// Flag a job for the next dispatcher tick.
    pub async fn request_run(&self, name: &str) -> Result<Job> {
        self.registry.request_run(name).await
    }

    /// Run the dispatcher once, outside its loop.
    pub async fn tick(&self) -> TickReport {
        self.dispatcher.tick().await
    }

    // ── Batches ─────────────────────────────────────────────────────────

    pub async fn list_batches(&self) -> Result<Vec<BatchConfig>> {
        self.catalog.list().await
    }

    pub async fn get_batch(&self, name: &str) -> Result<BatchConfig> {
        self.catalog.get(name).await
    }

    pub async fn create_batch(&self, create: BatchConfigCreate) -> Result<BatchConfig> {
        self.catalog.create(create).await
    }

    pub async fn update_batch(&self, name: &str, patch: BatchConfigPatch) -> Result<BatchConfig> {
        self.catalog.update(name, patch).await
    }

    pub async fn delete_batch(&self, name: &str) -> Result<()> {
        self.catalog.delete(name).await
    }

    pub async fn set_batch_enabled(&self, name: &str, enabled: bool) -> Result<BatchConfig> {
        self.catalog.set_enabled(name, enabled).await
    }

    pub async fn add_script(&self, batch: &str, script: ScriptRef) -> Result<BatchConfig> {
        self.catalog.add_script(batch, script).await
    }

    pub async fn remove_script(&self, batch: &str, script: &str) -> Result<BatchConfig> {
        self.catalog.remove_script(batch, script).await
    }

    pub async fn update_script(
        &self,
        batch: &str,
        script: &str,
        patch: ScriptRefPatch,
    ) -> Result<BatchConfig> {
        self.catalog.update_script(batch, script, patch).await
    }

    /// Run a batch now through the batch runner.
    pub async fn fire_batch(&self, name: &str) -> Result<BatchRunReport> {
        self.triggers.fire(name).await
    }

    /// Enabled batches whose fire time has passed since their last fire.
    pub async fn due_batches(&self) -> Result<Vec<DueBatch>> {
        let last_fired = self.triggers.last_fired();
        self.catalog.find_due(self.clock.now_ms(), &last_fired).await
    }

    // ── Triggers, reaper, stats ─────────────────────────────────────────

    pub async fn reload(&self) -> Result<ReloadReport> {
        self.triggers.reload().await
    }

    pub async fn trigger_status(&self) -> Vec<TriggerStatus> {
        self.triggers.status().await
    }

    /// Sweep stale runs now, with the configured threshold unless overridden.
    pub async fn sweep(&self, threshold: Option<Duration>) -> Result<ReapReport> {
        match threshold {
            Some(threshold) => self.reaper.sweep_with(threshold).await,
            None => self.reaper.sweep().await,
        }
    }

    /// Never fails: a store error degrades to zeroed stats.
    pub async fn stats(&self) -> SchedulerStats {
        let jobs = self.store.load_jobs(JobFilter::default()).await;
        let batches = self.store.load_batches().await;
        match (jobs, batches) {
            (Ok(jobs), Ok(batches)) => stats::compute(&jobs, &batches),
            (Err(e), _) | (_, Err(e)) => {
                error!(error = %e, "stats unavailable");
                SchedulerStats::default()
            },
        }
    }

    pub async fn error_rates(&self, threshold: f64) -> Result<Vec<ErrorRateEntry>> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(Error::validation("threshold must be between 0 and 1"));
        }
        let jobs = self.registry.list().await?;
        self.catalog.find_high_error_rate(threshold, &jobs).await
    }
}

fn summarize(job: Job, batches: &[BatchConfig]) -> JobSummary {
    let members: Vec<&BatchConfig> = batches
        .iter()
        .filter(|b| b.scripts.iter().any(|s| s.job_name() == job.name))
        .collect();
    let frequency = members
        .iter()
        .find(|b| b.enabled)
        .map(|b| schedule::describe(&b.schedule));

    JobSummary {
        batches: members.iter().map(|b| b.name.clone()).collect(),
        frequency,
        name: job.name,
        description: job.description,
        enabled: job.enabled,
        status: job.status,
        disabled_reason: job.disabled_reason,
        last_run_at_ms: job.last_run_at_ms,
        last_status: job.last_status,
        last_error: job.last_error,
        run_count: job.run_count,
        error_count: job.error_count,
        average_run_duration_ms: job.average_run_duration_ms,
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            clock::ManualClock,
            handler::{JobOutput, handler_fn},
            store_memory::InMemoryStore,
            test_support::{HOUR, T0, failing_handler, ok_handler},
            types::{BatchOutcome, JobStatus, RunStatus},
        },
    };

    fn scheduler(handlers: HandlerRegistry) -> (Arc<ManualClock>, Scheduler) {
        let clock = Arc::new(ManualClock::new(T0));
        let scheduler = Scheduler::with_clock(
            SchedulerConfig {
                retry_base_delay_ms: 1,
                retry_max_delay_ms: 5,
                ..Default::default()
            },
            Arc::new(InMemoryStore::new()),
            handlers,
            Arc::clone(&clock) as Arc<dyn Clock>,
            None,
        );
        (clock, scheduler)
    }

    fn nightly() -> BatchConfigCreate {
        BatchConfigCreate {
            name: "nightly".into(),
            schedule: "0 3 * * *".into(),
            category: Some("crm".into()),
            scripts: vec![ScriptRef::new("syncX", 1), ScriptRef::new("syncY", 2)],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn start_and_stop() {
        let mut handlers = HandlerRegistry::new();
        handlers.register("syncX", None, ok_handler());
        let (_, scheduler) = scheduler(handlers);
        scheduler.create_batch(nightly()).await.unwrap();

        let reload = scheduler.start().await.unwrap();
        assert_eq!(reload.active, vec!["nightly"]);
        assert!(scheduler.is_running().await);
        assert!(scheduler.start().await.is_err());

        scheduler.stop().await;
        assert!(!scheduler.is_running().await);
        assert!(scheduler.trigger_status().await.is_empty());
    }

    #[tokio::test]
    async fn list_jobs_shows_membership_and_frequency() {
        let mut handlers = HandlerRegistry::new();
        handlers
            .register("syncX", Some("CRM contacts".into()), ok_handler())
            .register("lonely", None, ok_handler());
        let (_, scheduler) = scheduler(handlers);
        scheduler.discover().await.unwrap();
        scheduler.create_batch(nightly()).await.unwrap();

        let jobs = scheduler.list_jobs().await.unwrap();
        let sync = jobs.iter().find(|j| j.name == "syncX").unwrap();
        assert_eq!(sync.batches, vec!["nightly"]);
        assert_eq!(sync.frequency.as_deref(), Some("daily at 03:00"));
        assert_eq!(sync.description.as_deref(), Some("CRM contacts"));
        let lonely = jobs.iter().find(|j| j.name == "lonely").unwrap();
        assert!(lonely.batches.is_empty());
        assert!(lonely.frequency.is_none());
    }

    #[tokio::test]
    async fn request_while_running_is_rejected() {
        let mut handlers = HandlerRegistry::new();
        handlers.register("syncX", None, ok_handler());
        let (_, scheduler) = scheduler(handlers);
        scheduler.discover().await.unwrap();
        scheduler
            .state
            .begin("syncX", crate::types::TriggerSource::Manual, 0)
            .await
            .unwrap();

        let err = scheduler.request_run("syncX").await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition {
            from: JobStatus::Running,
            ..
        }));
    }

    #[tokio::test]
    async fn manual_request_then_tick() {
        let mut handlers = HandlerRegistry::new();
        handlers.register(
            "syncX",
            None,
            handler_fn(|_| async { Ok(JobOutput::message("42 contacts")) }),
        );
        let (_, scheduler) = scheduler(handlers);
        scheduler.discover().await.unwrap();

        let job = scheduler.request_run("syncX").await.unwrap();
        assert_eq!(job.status, JobStatus::Requested);
        let tick = scheduler.tick().await;
        assert_eq!(tick.succeeded, 1);

        let history = scheduler.job_history("syncX", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, RunStatus::Succeeded);
        assert_eq!(history[0].message.as_deref(), Some("42 contacts"));
    }

    #[tokio::test]
    async fn stats_and_error_rates_after_a_fire() {
        let mut handlers = HandlerRegistry::new();
        handlers
            .register("syncX", None, ok_handler())
            .register("syncY", None, failing_handler("quota exceeded"));
        let (clock, scheduler) = scheduler(handlers);
        scheduler.discover().await.unwrap();
        scheduler.create_batch(nightly()).await.unwrap();

        clock.set(T0 + HOUR);
        let report = scheduler.fire_batch("nightly").await.unwrap();
        assert_eq!(report.outcome, BatchOutcome::Failed);

        let stats = scheduler.stats().await;
        assert_eq!(stats.total_runs, 2);
        assert_eq!(stats.total_errors, 1);
        assert_eq!(stats.categories["crm"].jobs, 2);

        let rates = scheduler.error_rates(0.4).await.unwrap();
        let names: Vec<_> = rates.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["syncY", "nightly"]);
        assert!(scheduler.error_rates(1.5).await.is_err());
    }

    #[tokio::test]
    async fn due_batches_follow_last_fire() {
        let (clock, scheduler) = scheduler(HandlerRegistry::new());
        scheduler.create_batch(nightly()).await.unwrap();
        assert!(scheduler.due_batches().await.unwrap().is_empty());

        clock.set(T0 + HOUR);
        let due = scheduler.due_batches().await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].due_at_ms, T0 + HOUR);

        scheduler.fire_batch("nightly").await.unwrap();
        assert!(scheduler.due_batches().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn zero_poll_interval_is_rejected_at_start() {
        let scheduler = Scheduler::with_clock(
            SchedulerConfig {
                poll_interval_secs: 0,
                ..Default::default()
            },
            Arc::new(InMemoryStore::new()),
            HandlerRegistry::new(),
            Arc::new(ManualClock::new(T0)) as Arc<dyn Clock>,
            None,
        );
        let err = scheduler.start().await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(err.to_string().contains("poll_interval_secs"));
        assert!(!scheduler.is_running().await);
    }

    #[tokio::test]
    async fn stored_job_without_handler_is_disabled_and_skipped() {
        let store: Arc<dyn SchedulerStore> = Arc::new(InMemoryStore::new());
        store.save_job(&Job::new("legacy", None, T0)).await.unwrap();
        let mut handlers = HandlerRegistry::new();
        handlers.register("syncX", None, ok_handler());
        let clock = Arc::new(ManualClock::new(T0));
        let scheduler = Scheduler::with_clock(
            SchedulerConfig::default(),
            store,
            handlers,
            Arc::clone(&clock) as Arc<dyn Clock>,
            None,
        );
        scheduler.discover().await.unwrap();

        let legacy = scheduler.get_job("legacy").await.unwrap();
        assert!(!legacy.enabled);
        assert_eq!(legacy.disabled_reason.as_deref(), Some(MISSING_HANDLER));
        assert!(scheduler.get_job("syncX").await.unwrap().enabled);
        assert!(matches!(
            scheduler.request_run("legacy").await.unwrap_err(),
            Error::InvalidTransition { .. }
        ));

        scheduler
            .create_batch(BatchConfigCreate {
                scripts: vec![ScriptRef::new("legacy", 1), ScriptRef::new("syncX", 2)],
                ..nightly()
            })
            .await
            .unwrap();
        clock.set(T0 + HOUR);
        let report = scheduler.fire_batch("nightly").await.unwrap();
        assert_eq!(report.outcome, BatchOutcome::Succeeded);
        assert_eq!(report.count(crate::types::ScriptRunStatus::Skipped), 1);
        assert_eq!(scheduler.get_job("legacy").await.unwrap().run_count, 0);
    }

    #[tokio::test]
    async fn remove_job_refuses_batch_members() {
        let mut handlers = HandlerRegistry::new();
        handlers
            .register("syncX", None, ok_handler())
            .register("syncY", None, ok_handler())
            .register("lonely", None, ok_handler());
        let (_, scheduler) = scheduler(handlers);
        scheduler.discover().await.unwrap();
        scheduler.create_batch(nightly()).await.unwrap();

        let err = scheduler.remove_job("syncX").await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(err.to_string().contains("nightly"));

        scheduler.remove_job("lonely").await.unwrap();
        assert!(scheduler.get_job("lonely").await.is_err());
    }

    #[tokio::test]
    async fn empty_stats_are_zeroed() {
        let (_, scheduler) = scheduler(HandlerRegistry::new());
        assert_eq!(scheduler.stats().await, SchedulerStats::default());
    }
}
