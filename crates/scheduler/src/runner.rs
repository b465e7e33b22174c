//! Executes the scripts of one batch fire, in order.

use std::{sync::Arc, time::Duration};

use tracing::{info, warn};

#[cfg(feature = "metrics")]
use crate::telemetry::{counter, names};
use crate::{
    clock::Clock,
    executor::Executor,
    registry::JobRegistry,
    types::{
        BatchConfig, BatchNotification, BatchOutcome, BatchRunReport, RunStatus, ScriptOutcome,
        ScriptRef, ScriptRunStatus, TriggerSource,
    },
};

/// Callback for batch notifications.
pub type NotifyFn = Arc<dyn Fn(BatchNotification) + Send + Sync>;

/// Exponential backoff between attempts of a failed script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt + 1`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

pub struct BatchRunner {
    registry: Arc<JobRegistry>,
    executor: Arc<Executor>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    default_timeout: Option<Duration>,
    on_notify: Option<NotifyFn>,
}

impl BatchRunner {
    pub fn new(
        registry: Arc<JobRegistry>,
        executor: Arc<Executor>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        default_timeout: Option<Duration>,
        on_notify: Option<NotifyFn>,
    ) -> Self {
        Self {
            registry,
            executor,
            clock,
            retry,
            default_timeout,
            on_notify,
        }
    }

    /// Run every enabled script of `batch`. Never fails: per-script problems
    /// end up in the report and in the job's history.
    pub async fn run(&self, batch: &BatchConfig) -> BatchRunReport {
        let fired_at_ms = self.clock.now_ms();
        let scripts = batch.runnable_scripts();
        info!(batch = %batch.name, scripts = scripts.len(), "batch fired");

        #[cfg(feature = "metrics")]
        counter!(names::BATCH_FIRES_TOTAL).increment(1);

        let timeout = batch
            .timeout_secs
            .map(Duration::from_secs)
            .or(self.default_timeout);

        let mut outcomes = Vec::with_capacity(scripts.len());
        for script in scripts {
            outcomes.push(self.run_script(batch, script, timeout).await);
        }

        let ran = outcomes
            .iter()
            .filter(|o| o.status != ScriptRunStatus::Skipped)
            .count();
        let outcome = if ran == 0 {
            BatchOutcome::Empty
        } else if outcomes.iter().any(|o| o.status == ScriptRunStatus::Failed) {
            BatchOutcome::Failed
        } else {
            BatchOutcome::Succeeded
        };

        let report = BatchRunReport {
            batch: batch.name.clone(),
            fired_at_ms,
            finished_at_ms: self.clock.now_ms(),
            outcome,
            scripts: outcomes,
        };

        info!(
            batch = %batch.name,
            outcome = ?report.outcome,
            succeeded = report.count(ScriptRunStatus::Succeeded),
            failed = report.count(ScriptRunStatus::Failed),
            skipped = report.count(ScriptRunStatus::Skipped),
            "batch finished"
        );
        self.maybe_notify(batch, &report);
        report
    }

    async fn run_script(
        &self,
        batch: &BatchConfig,
        script: &ScriptRef,
        timeout: Option<Duration>,
    ) -> ScriptOutcome {
        let job_name = script.job_name();
        let mut outcome = ScriptOutcome {
            script: script.name.clone(),
            job: job_name.to_string(),
            status: ScriptRunStatus::Skipped,
            run_id: None,
            attempts: 0,
            message: None,
        };

        match self.registry.get(job_name).await {
            Err(e) => {
                warn!(batch = %batch.name, script = %script.name, error = %e, "skipping unresolvable script");
                outcome.message = Some(e.to_string());
                return outcome;
            },
            Ok(job) if !job.enabled => {
                info!(batch = %batch.name, script = %script.name, "skipping disabled job");
                outcome.message = Some(match job.disabled_reason {
                    Some(reason) => format!("job disabled: {reason}"),
                    None => "job disabled".into(),
                });
                return outcome;
            },
            Ok(_) => {},
        }

        let trigger = TriggerSource::Batch {
            batch: batch.name.clone(),
        };
        let mut attempt = 0;
        loop {
            outcome.attempts = attempt + 1;
            match self
                .executor
                .execute(job_name, trigger.clone(), attempt, timeout)
                .await
            {
                Ok(run) => {
                    outcome.run_id = Some(run.id);
                    outcome.message = run.message;
                    if run.status == RunStatus::Succeeded {
                        outcome.status = ScriptRunStatus::Succeeded;
                        return outcome;
                    }
                    outcome.status = ScriptRunStatus::Failed;
                },
                Err(e) => {
                    warn!(batch = %batch.name, job = %job_name, error = %e, "script not started");
                    outcome.message = Some(e.to_string());
                    if attempt == 0 {
                        outcome.attempts = 0;
                        return outcome;
                    }
                    outcome.status = ScriptRunStatus::Failed;
                    return outcome;
                },
            }

            if attempt >= batch.max_retries {
                return outcome;
            }
            let delay = self.retry.delay(attempt);
            info!(
                batch = %batch.name,
                job = %job_name,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "retrying failed script"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    fn maybe_notify(&self, batch: &BatchConfig, report: &BatchRunReport) {
        let Some(notify) = &self.on_notify else {
            return;
        };
        let notification = match report.outcome {
            BatchOutcome::Failed if batch.notifications.on_error => BatchNotification::Failed {
                report: report.clone(),
            },
            BatchOutcome::Succeeded if batch.notifications.on_success => {
                BatchNotification::Succeeded {
                    report: report.clone(),
                }
            },
            _ => return,
        };
        notify(notification);
    }
}
