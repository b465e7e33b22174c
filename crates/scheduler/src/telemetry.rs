//! Metric names recorded through the `metrics` facade.

pub use metrics::{counter, gauge, histogram};

pub mod names {
    /// Job executions started
    pub const EXECUTIONS_TOTAL: &str = "synchro_executions_total";
    /// Executions that ended Failed, timeouts included
    pub const FAILURES_TOTAL: &str = "synchro_failures_total";
    /// Executions cut off by their timeout
    pub const TIMEOUTS_TOTAL: &str = "synchro_timeouts_total";
    /// Handler wall time in seconds
    pub const EXECUTION_DURATION_SECONDS: &str = "synchro_execution_duration_seconds";
    /// Open runs force-failed by the reaper
    pub const STALE_RUNS_REAPED_TOTAL: &str = "synchro_stale_runs_reaped_total";
    /// Batch fires, scheduled and manual
    pub const BATCH_FIRES_TOTAL: &str = "synchro_batch_fires_total";
    /// Cron bindings currently installed
    pub const BOUND_TRIGGERS: &str = "synchro_bound_triggers";
}
