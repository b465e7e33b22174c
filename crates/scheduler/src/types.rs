//! Core data types: jobs, run records, batches.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a job.
///
/// `Succeeded` and `Failed` are passed through on completion; a persisted job
/// rests in `Idle`, `Requested` or `Running`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    #[default]
    Idle,
    Requested,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Requested => "requested",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a run record, stored with the legacy numeric codes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "i8", into = "i8")]
pub enum RunStatus {
    Succeeded,
    Running,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub fn code(self) -> i8 {
        match self {
            Self::Succeeded => 0,
            Self::Running => 2,
            Self::Failed => -1,
        }
    }
}

impl From<RunStatus> for i8 {
    fn from(status: RunStatus) -> Self {
        status.code()
    }
}

impl TryFrom<i8> for RunStatus {
    type Error = String;

    fn try_from(code: i8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::Succeeded),
            2 => Ok(Self::Running),
            -1 => Ok(Self::Failed),
            other => Err(format!("unknown run status code {other}")),
        }
    }
}

/// Final outcome passed to `complete`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RunOutcome {
    Succeeded,
    Failed,
}

impl From<RunOutcome> for RunStatus {
    fn from(outcome: RunOutcome) -> Self {
        match outcome {
            RunOutcome::Succeeded => Self::Succeeded,
            RunOutcome::Failed => Self::Failed,
        }
    }
}

impl From<RunOutcome> for JobStatus {
    fn from(outcome: RunOutcome) -> Self {
        match outcome {
            RunOutcome::Succeeded => Self::Succeeded,
            RunOutcome::Failed => Self::Failed,
        }
    }
}

/// What started a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TriggerSource {
    /// Requested through the API and picked up by the dispatcher.
    Manual,
    /// Fired by a batch trigger.
    Batch { batch: String },
}

impl std::fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Manual => f.write_str("manual"),
            Self::Batch { batch } => write!(f, "batch:{batch}"),
        }
    }
}

/// One execution attempt of a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub id: String,
    pub status: RunStatus,
    pub trigger: TriggerSource,
    #[serde(default)]
    pub attempt: u32,
    pub started_at_ms: u64,
    /// `None` while the run is in flight.
    #[serde(default)]
    pub ended_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub external_call_count: u64,
}

impl RunRecord {
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.ended_at_ms.is_none()
    }

    #[must_use]
    pub fn duration_ms(&self) -> Option<u64> {
        self.ended_at_ms
            .map(|end| end.saturating_sub(self.started_at_ms))
    }
}

/// A named unit of work and its execution state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub status: JobStatus,
    /// Why the job was disabled at registration (handler load failure).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_reason: Option<String>,
    /// Run id handed out by `request_run`, reused by `begin`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub run_count: u64,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default)]
    pub average_run_duration_ms: f64,
    /// Oldest first.
    #[serde(default)]
    pub history: Vec<RunRecord>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl Job {
    #[must_use]
    pub fn new(name: impl Into<String>, description: Option<String>, now_ms: u64) -> Self {
        Self {
            name: name.into(),
            description,
            enabled: true,
            status: JobStatus::Idle,
            disabled_reason: None,
            requested_run_id: None,
            requested_at_ms: None,
            last_run_at_ms: None,
            last_status: None,
            last_error: None,
            run_count: 0,
            error_count: 0,
            average_run_duration_ms: 0.0,
            history: Vec::new(),
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        }
    }

    /// The in-flight run, if any.
    #[must_use]
    pub fn open_run(&self) -> Option<&RunRecord> {
        self.history.iter().rev().find(|r| r.is_open())
    }

    #[must_use]
    pub fn latest_run(&self) -> Option<&RunRecord> {
        self.history.last()
    }

    #[must_use]
    pub fn error_rate(&self) -> f64 {
        ratio(self.error_count, self.run_count)
    }

    /// Drop the oldest closed records beyond `limit`. Open records stay.
    pub fn trim_history(&mut self, limit: usize) {
        let mut excess = self.history.len().saturating_sub(limit);
        if excess == 0 {
            return;
        }
        self.history.retain(|r| {
            if excess > 0 && !r.is_open() {
                excess -= 1;
                false
            } else {
                true
            }
        });
    }
}

/// Filter for [`crate::store::SchedulerStore::load_jobs`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub enabled: Option<bool>,
}

impl JobFilter {
    #[must_use]
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            enabled: None,
        }
    }

    #[must_use]
    pub fn enabled() -> Self {
        Self {
            status: None,
            enabled: Some(true),
        }
    }

    #[must_use]
    pub fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|s| job.status == s) && self.enabled.is_none_or(|e| job.enabled == e)
    }
}

/// Membership of a job in a batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScriptRef {
    #[serde(default)]
    pub name: String,
    /// Handler id of the job to run. Defaults to `name`, so two scripts with
    /// different names may share one job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub order: i32,
}

impl ScriptRef {
    #[must_use]
    pub fn new(name: impl Into<String>, order: i32) -> Self {
        Self {
            name: name.into(),
            handler: None,
            enabled: true,
            order,
        }
    }

    /// Name of the job this script runs.
    #[must_use]
    pub fn job_name(&self) -> &str {
        self.handler
            .as_deref()
            .filter(|h| !h.is_empty())
            .unwrap_or(&self.name)
    }
}

/// Partial update of a [`ScriptRef`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptRefPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<i32>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Notifications {
    #[serde(default)]
    pub on_error: bool,
    #[serde(default)]
    pub on_success: bool,
}

/// A named group of jobs sharing one cron schedule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Five-field cron expression.
    pub schedule: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Per-script timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub notifications: Notifications,
    #[serde(default)]
    pub scripts: Vec<ScriptRef>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl BatchConfig {
    /// Enabled scripts sorted by `order`; ties keep declaration order.
    #[must_use]
    pub fn runnable_scripts(&self) -> Vec<&ScriptRef> {
        let mut scripts: Vec<&ScriptRef> = self.scripts.iter().filter(|s| s.enabled).collect();
        scripts.sort_by_key(|s| s.order);
        scripts
    }

    #[must_use]
    pub fn category_or_default(&self) -> &str {
        self.category.as_deref().unwrap_or(UNCATEGORIZED)
    }
}

pub const UNCATEGORIZED: &str = "uncategorized";

/// Input for creating a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchConfigCreate {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub schedule: String,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub notifications: Notifications,
    #[serde(default)]
    pub scripts: Vec<ScriptRef>,
}

impl Default for BatchConfigCreate {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: None,
            schedule: String::new(),
            timezone: None,
            enabled: true,
            priority: 0,
            category: None,
            timeout_secs: None,
            max_retries: 0,
            notifications: Notifications::default(),
            scripts: Vec::new(),
        }
    }
}

/// Partial update of a batch. The name is the key and cannot change.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BatchConfigPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notifications: Option<Notifications>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scripts: Option<Vec<ScriptRef>>,
}

fn default_true() -> bool {
    true
}

/// How one script of a batch fire ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ScriptRunStatus {
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScriptOutcome {
    pub script: String,
    pub job: String,
    pub status: ScriptRunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum BatchOutcome {
    /// Every executed script succeeded.
    Succeeded,
    /// At least one script failed.
    Failed,
    /// Nothing was executed.
    Empty,
}

/// Observability record of one batch fire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchRunReport {
    pub batch: String,
    pub fired_at_ms: u64,
    pub finished_at_ms: u64,
    pub outcome: BatchOutcome,
    pub scripts: Vec<ScriptOutcome>,
}

impl BatchRunReport {
    #[must_use]
    pub fn count(&self, status: ScriptRunStatus) -> usize {
        self.scripts.iter().filter(|s| s.status == status).count()
    }
}

/// Emitted after a batch fire when the batch asks for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum BatchNotification {
    Succeeded { report: BatchRunReport },
    Failed { report: BatchRunReport },
}

/// Summary of one stale-run sweep.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReapReport {
    pub logs_updated: usize,
    pub jobs_affected: usize,
    /// Runs started before this instant were considered stale.
    pub threshold_ms: u64,
    pub job_names: Vec<String>,
}

/// A batch whose next fire time has passed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DueBatch {
    pub name: String,
    pub schedule: String,
    pub due_at_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ErrorRateKind {
    Batch,
    Job,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRateEntry {
    pub kind: ErrorRateKind,
    pub name: String,
    pub run_count: u64,
    pub error_count: u64,
    pub error_rate: f64,
}

/// Dashboard row for a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub enabled: bool,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disabled_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_status: Option<RunStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub run_count: u64,
    pub error_count: u64,
    pub average_run_duration_ms: f64,
    /// Batches this job is a member of.
    pub batches: Vec<String>,
    /// Human-readable schedule of the first enabled member batch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CategoryStats {
    pub batches: usize,
    pub enabled_batches: usize,
    pub jobs: usize,
    pub runs: u64,
    pub errors: u64,
    pub error_rate: f64,
}

/// Aggregate numbers for the dashboard.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
    pub total_jobs: usize,
    pub enabled_jobs: usize,
    pub requested_jobs: usize,
    pub running_jobs: usize,
    pub total_batches: usize,
    pub enabled_batches: usize,
    pub total_runs: u64,
    pub total_errors: u64,
    pub error_rate: f64,
    pub categories: BTreeMap<String, CategoryStats>,
}

/// `num / den`, or 0 when there is nothing to divide.
#[must_use]
pub fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}
