//! Poll loop for manually requested jobs.

use std::{sync::Arc, time::Duration};

use {
    serde::Serialize,
    tokio::sync::watch,
    tracing::{debug, error, info, warn},
};

use crate::{executor::Executor, registry::JobRegistry, types::RunStatus};

/// Default tick.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
    pub picked: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Requested jobs that could not be started.
    pub skipped: usize,
}

pub struct Dispatcher {
    registry: Arc<JobRegistry>,
    executor: Arc<Executor>,
    timeout: Option<Duration>,
}

impl Dispatcher {
    pub fn new(registry: Arc<JobRegistry>, executor: Arc<Executor>, timeout: Option<Duration>) -> Self {
        Self {
            registry,
            executor,
            timeout,
        }
    }

    /// Run every requested job once, one after another, in registry order.
    ///
    /// A failing job never stops the tick.
    pub async fn tick(&self) -> TickReport {
        let requested = match self.registry.list_requested().await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "dispatcher could not list requested jobs");
                return TickReport::default();
            },
        };

        let mut report = TickReport {
            picked: requested.len(),
            ..Default::default()
        };
        if requested.is_empty() {
            debug!("dispatcher tick: nothing requested");
            return report;
        }

        for job in requested {
            // The snapshot may be stale by now: earlier jobs of this tick can
            // disable a job or a batch fire can consume its request.
            match self.executor.execute_requested(&job.name, self.timeout).await {
                Ok(run) if run.status == RunStatus::Succeeded => report.succeeded += 1,
                Ok(_) => report.failed += 1,
                Err(e) => {
                    warn!(job = %job.name, error = %e, "requested job not started");
                    report.skipped += 1;
                },
            }
        }

        info!(
            picked = report.picked,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            "dispatcher tick finished"
        );
        report
    }

    /// Tick every `interval` until `shutdown` flips to true. The first tick is immediate.
    pub async fn run_loop(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "dispatcher started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {},
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            self.tick().await;
        }
        info!("dispatcher stopped");
    }
}
