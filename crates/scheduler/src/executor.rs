//! One run of one job: `begin`, invoke the handler under a timeout, `complete`.

use std::{sync::Arc, time::Duration};

use tracing::{error, warn};

#[cfg(feature = "metrics")]
use crate::telemetry::{counter, histogram, names};
use crate::{
    Error, Result,
    handler::{HandlerRegistry, JobContext, JobOutput},
    state::JobStateMachine,
    types::{RunOutcome, RunRecord, TriggerSource},
};

pub struct Executor {
    state: Arc<JobStateMachine>,
    handlers: Arc<HandlerRegistry>,
}

impl Executor {
    pub fn new(state: Arc<JobStateMachine>, handlers: Arc<HandlerRegistry>) -> Self {
        Self { state, handlers }
    }

    pub fn state(&self) -> &Arc<JobStateMachine> {
        &self.state
    }

    /// Execute `name` once and return its closed run record.
    ///
    /// Errors only if the run could not be opened or closed. A failing,
    /// panicking or timed-out handler yields a `Failed` record instead.
    pub async fn execute(
        &self,
        name: &str,
        trigger: TriggerSource,
        attempt: u32,
        timeout: Option<Duration>,
    ) -> Result<RunRecord> {
        let run = self.state.begin(name, trigger.clone(), attempt).await?;
        self.finish(name, run, trigger, attempt, timeout).await
    }

    /// Execute a manually requested job, only if the request is still live.
    pub async fn execute_requested(&self, name: &str, timeout: Option<Duration>) -> Result<RunRecord> {
        let run = self.state.begin_requested(name).await?;
        self.finish(name, run, TriggerSource::Manual, 0, timeout).await
    }

    async fn finish(
        &self,
        name: &str,
        run: RunRecord,
        trigger: TriggerSource,
        attempt: u32,
        timeout: Option<Duration>,
    ) -> Result<RunRecord> {
        #[cfg(feature = "metrics")]
        counter!(names::EXECUTIONS_TOTAL).increment(1);

        let ctx = JobContext {
            job_name: name.to_string(),
            run_id: run.id.clone(),
            trigger,
            attempt,
        };
        let result = self.invoke(ctx, timeout).await;

        let (outcome, message, calls) = match result {
            Ok(out) => (RunOutcome::Succeeded, out.message, out.external_call_count),
            Err(e) => {
                #[cfg(feature = "metrics")]
                {
                    counter!(names::FAILURES_TOTAL).increment(1);
                    if matches!(e, Error::Timeout { .. }) {
                        counter!(names::TIMEOUTS_TOTAL).increment(1);
                    }
                }
                error!(job = %name, run_id = %run.id, error = %e, "handler failed");
                (RunOutcome::Failed, Some(e.to_string()), 0)
            },
        };

        let job = self
            .state
            .complete(name, &run.id, outcome, message, calls)
            .await
            .inspect_err(|e| warn!(job = %name, run_id = %run.id, error = %e, "could not close run"))?;

        let closed = job
            .history
            .iter()
            .rev()
            .find(|r| r.id == run.id)
            .cloned()
            .ok_or_else(|| Error::run_not_found(&run.id))?;

        #[cfg(feature = "metrics")]
        if let Some(ms) = closed.duration_ms() {
            histogram!(names::EXECUTION_DURATION_SECONDS).record(ms as f64 / 1000.0);
        }

        Ok(closed)
    }

    /// Run the handler on its own task so a panic is caught, bounded by `timeout`.
    async fn invoke(&self, ctx: JobContext, timeout: Option<Duration>) -> Result<JobOutput> {
        let name = ctx.job_name.clone();
        let Some(handler) = self.handlers.get(&name) else {
            return Err(Error::handler(&name, format!("no handler registered for {name}")));
        };

        let mut task = tokio::spawn(async move { handler.run(ctx).await });
        let joined = match timeout.filter(|d| !d.is_zero()) {
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    task.abort();
                    return Err(Error::timeout(&name, limit.as_secs()));
                },
            },
            None => task.await,
        };

        match joined {
            Ok(Ok(out)) => Ok(out),
            Ok(Err(e)) => Err(Error::handler(&name, format!("{e:#}"))),
            Err(join) if join.is_panic() => Err(Error::handler(&name, "handler panicked")),
            Err(join) => Err(Error::handler(&name, join.to_string())),
        }
    }
}
