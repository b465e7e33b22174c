use thiserror::Error;

use crate::types::JobStatus;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("validation failed: {message}")]
    Validation { message: String },

    #[error("invalid schedule '{expr}': {reason}")]
    InvalidSchedule { expr: String, reason: String },

    #[error("unknown timezone: {timezone}")]
    UnknownTimezone { timezone: String },

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("cannot {action} job {job} while it is {from}")]
    InvalidTransition {
        job: String,
        from: JobStatus,
        action: &'static str,
    },

    #[error("batch {name} is already firing")]
    BatchFiring { name: String },

    #[error("run {run_id} of job {job} is not open")]
    RecordNotOpen { job: String, run_id: String },

    /// A handler body failed; the message is recorded verbatim.
    #[error("{message}")]
    Handler { job: String, message: String },

    #[error("timeout")]
    Timeout { job: String, after_secs: u64 },

    #[error("{message}")]
    Message { message: String },

    #[error("{context}: {source}")]
    External {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn invalid_schedule(expr: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSchedule {
            expr: expr.into(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn unknown_timezone(timezone: impl Into<String>) -> Self {
        Self::UnknownTimezone {
            timezone: timezone.into(),
        }
    }

    #[must_use]
    pub fn job_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "job",
            name: name.into(),
        }
    }

    #[must_use]
    pub fn batch_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "batch",
            name: name.into(),
        }
    }

    #[must_use]
    pub fn script_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "script",
            name: name.into(),
        }
    }

    #[must_use]
    pub fn run_not_found(run_id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "run",
            name: run_id.into(),
        }
    }

    #[must_use]
    pub fn already_exists(kind: &'static str, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind,
            name: name.into(),
        }
    }

    #[must_use]
    pub fn invalid_transition(job: impl Into<String>, from: JobStatus, action: &'static str) -> Self {
        Self::InvalidTransition {
            job: job.into(),
            from,
            action,
        }
    }

    #[must_use]
    pub fn batch_firing(name: impl Into<String>) -> Self {
        Self::BatchFiring { name: name.into() }
    }

    #[must_use]
    pub fn record_not_open(job: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self::RecordNotOpen {
            job: job.into(),
            run_id: run_id.into(),
        }
    }

    #[must_use]
    pub fn handler(job: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handler {
            job: job.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn timeout(job: impl Into<String>, after_secs: u64) -> Self {
        Self::Timeout {
            job: job.into(),
            after_secs,
        }
    }

    #[must_use]
    pub fn external(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::External {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Errors caused by the caller's input rather than by the system.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. }
                | Self::InvalidSchedule { .. }
                | Self::UnknownTimezone { .. }
                | Self::NotFound { .. }
                | Self::AlreadyExists { .. }
                | Self::InvalidTransition { .. }
                | Self::BatchFiring { .. }
                | Self::RecordNotOpen { .. }
        )
    }
}

impl synchro_common::FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message { message }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

synchro_common::impl_context!(Error);
