use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid task: {0}")]
    InvalidTask(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Assignment capacity exceeded: {active} of {cap} tasks active")]
    AssignmentCapacityExceeded { active: usize, cap: usize },

    #[error("Advisor unavailable: {0}")]
    AdvisorUnavailable(String),

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::InvalidTask(_) => StatusCode::BAD_REQUEST,
            AppError::InvalidTransition(_) => StatusCode::CONFLICT,
            AppError::AssignmentCapacityExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::AdvisorUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::InvariantViolation(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get error type as string for JSON responses
    pub fn error_type(&self) -> &'static str {
        match self {
            AppError::InvalidTask(_) => "invalid_task",
            AppError::InvalidTransition(_) => "invalid_transition",
            AppError::AssignmentCapacityExceeded { .. } => "assignment_capacity_exceeded",
            AppError::AdvisorUnavailable(_) => "advisor_unavailable",
            AppError::InvariantViolation(_) => "invariant_violation",
            AppError::Database(_) => "database_error",
            AppError::Internal(_) => "internal_error",
            AppError::Serialization(_) => "serialization_error",
            AppError::Validation(_) => "validation_error",
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::Io(_) => "io_error",
        }
    }

    /// Check if this error should be logged
    pub fn should_log(&self) -> bool {
        match self {
            // Rejected commands are the caller's problem
            AppError::InvalidTask(_)
            | AppError::InvalidTransition(_)
            | AppError::AssignmentCapacityExceeded { .. }
            | AppError::Validation(_)
            | AppError::NotFound(_)
            | AppError::Conflict(_) => false,

            AppError::AdvisorUnavailable(_)
            | AppError::InvariantViolation(_)
            | AppError::Database(_)
            | AppError::Internal(_)
            | AppError::Serialization(_)
            | AppError::Io(_) => true,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if self.should_log() {
            tracing::error!("AppError: {} (status: {})", self, status);
        } else {
            tracing::debug!("AppError: {} (status: {})", self, status);
        }

        let body = json!({
            "error": {
                "type": self.error_type(),
                "message": self.to_string(),
                "status": status.as_u16()
            }
        });

        (status, Json(body)).into_response()
    }
}

// Convenience constructors
impl AppError {
    pub fn invalid_task<T: std::fmt::Display>(msg: T) -> Self {
        Self::InvalidTask(msg.to_string())
    }

    pub fn invalid_transition<T: std::fmt::Display>(msg: T) -> Self {
        Self::InvalidTransition(msg.to_string())
    }

    pub fn advisor_unavailable<T: std::fmt::Display>(msg: T) -> Self {
        Self::AdvisorUnavailable(msg.to_string())
    }

    pub fn invariant<T: std::fmt::Display>(msg: T) -> Self {
        Self::InvariantViolation(msg.to_string())
    }

    pub fn validation<T: std::fmt::Display>(msg: T) -> Self {
        Self::Validation(msg.to_string())
    }

    pub fn not_found<T: std::fmt::Display>(msg: T) -> Self {
        Self::NotFound(msg.to_string())
    }

    pub fn conflict<T: std::fmt::Display>(msg: T) -> Self {
        Self::Conflict(msg.to_string())
    }
}

impl From<rmp_serde::encode::Error> for AppError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for AppError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(format!("YAML error: {}", err))
    }
}

pub type AppResult<T> = Result<T, AppError>;
