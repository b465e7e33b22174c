//! Run lifecycle: `begin` opens a run record, `complete` closes it.
//!
//! The Idle/Requested guard on `begin` is what keeps two executions of the
//! same job from overlapping.

use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    Error, Result,
    registry::JobRegistry,
    types::{Job, JobStatus, RunOutcome, RunRecord, RunStatus, TriggerSource},
};

pub struct JobStateMachine {
    registry: Arc<JobRegistry>,
}

impl JobStateMachine {
    pub fn new(registry: Arc<JobRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Idle or Requested to Running. Appends an open run record.
    pub async fn begin(&self, name: &str, trigger: TriggerSource, attempt: u32) -> Result<RunRecord> {
        self.open(name, trigger, attempt, false).await
    }

    /// Requested to Running, for the dispatcher.
    ///
    /// Checked under the same write as the transition: a request withdrawn
    /// by disabling the job, or already consumed by a batch fire, is
    /// rejected with `InvalidTransition`.
    pub async fn begin_requested(&self, name: &str) -> Result<RunRecord> {
        self.open(name, TriggerSource::Manual, 0, true).await
    }

    async fn open(
        &self,
        name: &str,
        trigger: TriggerSource,
        attempt: u32,
        requested_only: bool,
    ) -> Result<RunRecord> {
        let (job, run) = self
            .registry
            .mutate(name, |job, now| {
                if requested_only && (job.status != JobStatus::Requested || !job.enabled) {
                    return Err(Error::invalid_transition(
                        &job.name,
                        job.status,
                        "begin requested",
                    ));
                }
                if !matches!(job.status, JobStatus::Idle | JobStatus::Requested) {
                    return Err(Error::invalid_transition(&job.name, job.status, "begin"));
                }
                if job.open_run().is_some() {
                    return Err(Error::invalid_transition(&job.name, JobStatus::Running, "begin"));
                }

                let id = job
                    .requested_run_id
                    .take()
                    .filter(|_| job.status == JobStatus::Requested)
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                job.requested_at_ms = None;

                let run = RunRecord {
                    id,
                    status: RunStatus::Running,
                    trigger,
                    attempt,
                    started_at_ms: now,
                    ended_at_ms: None,
                    message: None,
                    external_call_count: 0,
                };
                job.history.push(run.clone());
                job.status = JobStatus::Running;
                job.last_run_at_ms = Some(now);
                Ok(run)
            })
            .await?;

        info!(
            job = %job.name,
            run_id = %run.id,
            trigger = %run.trigger,
            attempt = run.attempt,
            "job started"
        );
        Ok(run)
    }

    /// Close an open run and return the job to Idle.
    ///
    /// `average_run_duration_ms` is a running mean over all completed runs.
    pub async fn complete(
        &self,
        name: &str,
        run_id: &str,
        outcome: RunOutcome,
        message: Option<String>,
        external_call_count: u64,
    ) -> Result<Job> {
        let (job, duration_ms) = self
            .registry
            .mutate(name, |job, now| {
                let run = job
                    .history
                    .iter_mut()
                    .find(|r| r.id == run_id)
                    .ok_or_else(|| Error::run_not_found(run_id))?;
                if !run.is_open() {
                    return Err(Error::record_not_open(name, run_id));
                }

                run.ended_at_ms = Some(now);
                run.status = outcome.into();
                run.message = message.clone();
                run.external_call_count = external_call_count;
                let duration = now.saturating_sub(run.started_at_ms);

                let prev = job.run_count as f64;
                job.average_run_duration_ms =
                    (job.average_run_duration_ms * prev + duration as f64) / (prev + 1.0);
                job.run_count += 1;
                job.last_status = Some(outcome.into());
                if outcome == RunOutcome::Failed {
                    job.error_count += 1;
                    job.last_error = message;
                }
                job.status = JobStatus::Idle;
                Ok(duration)
            })
            .await?;

        match outcome {
            RunOutcome::Succeeded => {
                info!(job = %job.name, run_id, duration_ms, "job succeeded")
            },
            RunOutcome::Failed => warn!(
                job = %job.name,
                run_id,
                duration_ms,
                error = job.last_error.as_deref().unwrap_or_default(),
                "job failed"
            ),
        }
        Ok(job)
    }

    /// Most recent `limit` run records, newest first.
    pub async fn history(&self, name: &str, limit: usize) -> Result<Vec<RunRecord>> {
        let job = self.registry.get(name).await?;
        Ok(job.history.into_iter().rev().take(limit).collect())
    }
}
