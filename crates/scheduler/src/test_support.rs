//! Fully wired engine over an in-memory store and a manual clock.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::{
    catalog::BatchCatalog,
    clock::{Clock, ManualClock},
    dispatcher::Dispatcher,
    executor::Executor,
    handler::{HandlerRegistry, JobHandler, JobOutput, handler_fn},
    reaper::Reaper,
    registry::JobRegistry,
    runner::{BatchRunner, NotifyFn, RetryPolicy},
    service::MISSING_HANDLER,
    state::JobStateMachine,
    store::SchedulerStore,
    store_memory::InMemoryStore,
    triggers::TriggerManager,
    types::{BatchConfig, Notifications, ScriptRef},
};

/// 2026-01-19 02:00 UTC
pub(crate) const T0: u64 = 1_768_788_000_000;
pub(crate) const HOUR: u64 = 3_600_000;

const STALE_THRESHOLD: Duration = Duration::from_secs(3 * 24 * 3600);

pub(crate) struct Harness {
    pub clock: Arc<ManualClock>,
    pub store: Arc<dyn SchedulerStore>,
    pub registry: Arc<JobRegistry>,
    pub state: Arc<JobStateMachine>,
    pub executor: Arc<Executor>,
    pub dispatcher: Arc<Dispatcher>,
    pub catalog: Arc<BatchCatalog>,
    pub runner: Arc<BatchRunner>,
    pub triggers: Arc<TriggerManager>,
    pub reaper: Arc<Reaper>,
}

#[derive(Default)]
pub(crate) struct HarnessBuilder {
    handlers: HandlerRegistry,
    bare_jobs: Vec<String>,
    on_notify: Option<NotifyFn>,
}

impl HarnessBuilder {
    pub fn handler(mut self, name: &str, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.register(name, None, handler);
        self
    }

    /// A handler whose factory fails to load.
    pub fn failing_factory(mut self, name: &str, message: &'static str) -> Self {
        self.handlers
            .register_factory(name, None, move || Err(anyhow::anyhow!(message)));
        self
    }

    /// A stored job with no handler behind it, disabled as discovery leaves it.
    pub fn job(mut self, name: &str) -> Self {
        self.bare_jobs.push(name.to_string());
        self
    }

    pub fn on_notify(mut self, notify: NotifyFn) -> Self {
        self.on_notify = Some(notify);
        self
    }

    pub async fn build(self) -> Harness {
        let clock = Arc::new(ManualClock::new(T0));
        let dyn_clock: Arc<dyn Clock> = Arc::clone(&clock) as Arc<dyn Clock>;
        let store: Arc<dyn SchedulerStore> = Arc::new(InMemoryStore::new());
        let registry = Arc::new(JobRegistry::new(
            Arc::clone(&store),
            Arc::clone(&dyn_clock),
            100,
        ));

        for found in self.handlers.discover() {
            registry
                .register(&found.name, found.description, found.error)
                .await
                .unwrap();
        }
        for name in &self.bare_jobs {
            registry
                .register(name, None, Some(MISSING_HANDLER.to_string()))
                .await
                .unwrap();
        }

        let handlers = Arc::new(self.handlers);
        let state = Arc::new(JobStateMachine::new(Arc::clone(&registry)));
        let executor = Arc::new(Executor::new(Arc::clone(&state), handlers));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&executor),
            None,
        ));
        let catalog = Arc::new(BatchCatalog::new(
            Arc::clone(&store),
            Arc::clone(&dyn_clock),
            "UTC",
        ));
        let runner = Arc::new(BatchRunner::new(
            Arc::clone(&registry),
            Arc::clone(&executor),
            Arc::clone(&dyn_clock),
            fast_retry(),
            None,
            self.on_notify,
        ));
        let triggers = Arc::new(TriggerManager::new(
            Arc::clone(&catalog),
            Arc::clone(&runner),
            Arc::clone(&dyn_clock),
        ));
        let reaper = Arc::new(Reaper::new(Arc::clone(&state), STALE_THRESHOLD));

        Harness {
            clock,
            store,
            registry,
            state,
            executor,
            dispatcher,
            catalog,
            runner,
            triggers,
            reaper,
        }
    }
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::default()
    }

    /// A runner sharing this harness' engine but with its own default timeout.
    pub fn runner_with_timeout(&self, timeout: Duration) -> BatchRunner {
        BatchRunner::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.executor),
            Arc::clone(&self.clock) as Arc<dyn Clock>,
            fast_retry(),
            Some(timeout),
            None,
        )
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    }
}

pub(crate) fn ok_handler() -> Arc<dyn JobHandler> {
    handler_fn(|_| async { Ok(JobOutput::message("ok")) })
}

pub(crate) fn failing_handler(message: &'static str) -> Arc<dyn JobHandler> {
    handler_fn(move |_| async move { anyhow::bail!(message) })
}

/// A handler that appends the name of every job it runs.
pub(crate) fn recording_handler() -> (Arc<Mutex<Vec<String>>>, Arc<dyn JobHandler>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let handler = handler_fn(move |ctx| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock().unwrap().push(ctx.job_name);
            Ok(JobOutput::default())
        }
    });
    (log, handler)
}

pub(crate) fn batch_with(name: &str, scripts: &[(&str, i32)]) -> BatchConfig {
    BatchConfig {
        name: name.into(),
        description: None,
        schedule: "0 3 * * *".into(),
        timezone: None,
        enabled: true,
        priority: 0,
        category: None,
        timeout_secs: None,
        max_retries: 0,
        notifications: Notifications::default(),
        scripts: scripts
            .iter()
            .map(|(script, order)| ScriptRef::new(*script, *order))
            .collect(),
        created_at_ms: T0,
        updated_at_ms: T0,
    }
}
