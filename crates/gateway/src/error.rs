use {
    axum::{
        Json,
        http::StatusCode,
        response::{IntoResponse, Response},
    },
    synchro_scheduler::Error as SchedulerError,
    tracing::error,
};

/// Error returned by every API route.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// The request body or query could not be read.
    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    /// HTTP status and stable error code.
    #[must_use]
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        let Self::Scheduler(err) = self else {
            return (StatusCode::BAD_REQUEST, "validation");
        };
        match err {
            SchedulerError::Validation { .. } => (StatusCode::BAD_REQUEST, "validation"),
            SchedulerError::InvalidSchedule { .. } => (StatusCode::BAD_REQUEST, "invalid_schedule"),
            SchedulerError::UnknownTimezone { .. } => (StatusCode::BAD_REQUEST, "unknown_timezone"),
            SchedulerError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            SchedulerError::AlreadyExists { .. } => (StatusCode::CONFLICT, "already_exists"),
            SchedulerError::InvalidTransition { .. } => (StatusCode::CONFLICT, "invalid_transition"),
            SchedulerError::RecordNotOpen { .. } => (StatusCode::CONFLICT, "record_not_open"),
            SchedulerError::BatchFiring { .. } => (StatusCode::CONFLICT, "batch_firing"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        let body = serde_json::json!({
            "error": code,
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}
