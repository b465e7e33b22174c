//! Stale-run sweep: force-fails runs left open by a crash.

use std::{sync::Arc, time::Duration};

use {
    tokio::sync::watch,
    tracing::{debug, error, info, warn},
};

#[cfg(feature = "metrics")]
use crate::telemetry::{counter, names};
use crate::{
    Error, Result,
    state::JobStateMachine,
    types::{ReapReport, RunOutcome},
};

/// Message recorded on reaped runs.
pub const STALE_MESSAGE: &str = "stale timeout";

pub struct Reaper {
    state: Arc<JobStateMachine>,
    threshold: Duration,
}

impl Reaper {
    pub fn new(state: Arc<JobStateMachine>, threshold: Duration) -> Self {
        Self { state, threshold }
    }

    /// Sweep with the configured threshold at the current time.
    pub async fn sweep(&self) -> Result<ReapReport> {
        self.sweep_with(self.threshold).await
    }

    /// Close every open run that started before `now - threshold`.
    pub async fn sweep_with(&self, threshold: Duration) -> Result<ReapReport> {
        let registry = self.state.registry();
        let now = registry.now_ms();
        let cutoff = now.saturating_sub(threshold.as_millis() as u64);
        let mut report = ReapReport {
            threshold_ms: cutoff,
            ..Default::default()
        };

        for job in registry.list().await? {
            let stale: Vec<String> = job
                .history
                .iter()
                .filter(|r| r.is_open() && r.started_at_ms < cutoff)
                .map(|r| r.id.clone())
                .collect();
            if stale.is_empty() {
                continue;
            }

            let mut closed = 0;
            for run_id in stale {
                match self
                    .state
                    .complete(&job.name, &run_id, RunOutcome::Failed, Some(STALE_MESSAGE.into()), 0)
                    .await
                {
                    Ok(_) => closed += 1,
                    // Completed by its handler in the meantime.
                    Err(Error::RecordNotOpen { .. }) => {
                        debug!(job = %job.name, run_id = %run_id, "stale run closed concurrently");
                    },
                    Err(e) => error!(job = %job.name, run_id = %run_id, error = %e, "failed to reap run"),
                }
            }
            if closed > 0 {
                warn!(job = %job.name, runs = closed, "reaped stale runs");
                report.logs_updated += closed;
                report.jobs_affected += 1;
                report.job_names.push(job.name.clone());
            }
        }

        #[cfg(feature = "metrics")]
        counter!(names::STALE_RUNS_REAPED_TOTAL).increment(report.logs_updated as u64);

        info!(
            logs_updated = report.logs_updated,
            jobs_affected = report.jobs_affected,
            threshold_ms = report.threshold_ms,
            "reaper sweep finished"
        );
        Ok(report)
    }

    /// Sweep every `interval` until `shutdown` flips to true.
    pub async fn run_loop(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "reaper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {},
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.sweep().await {
                error!(error = %e, "reaper sweep failed");
            }
        }
        info!("reaper stopped");
    }
}
