//! Error types for pgview

use thiserror::Error;
use uuid::Uuid;

use crate::types::ApiError;

/// pgview error types
#[derive(Error, Debug)]
pub enum Error {
    // Caller Errors
    #[error("Validation error at {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Compilation error at {field}: {message}")]
    Compilation { field: String, message: String },

    // Backend Errors
    #[error("Estimation error: {0}")]
    Estimation(String),

    #[error("Execution timed out after {timeout_ms}ms")]
    ExecutionTimeout { timeout_ms: u64 },

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Connection pool error: {0}")]
    Pool(String),

    // Versioning Errors
    #[error("Version conflict on view {view_id}: expected latest {expected}, found {found}")]
    VersionConflict {
        view_id: Uuid,
        expected: String,
        found: String,
    },

    // View Errors
    #[error("View not found: {0}")]
    ViewNotFound(Uuid),

    #[error("View already exists: {0}")]
    ViewAlreadyExists(String),

    // General Errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for pgview operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for a validation error on `field`.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a compilation error on `field`.
    pub fn compilation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Compilation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// HTTP status code for each error type
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            // 400 Bad Request
            Self::Validation { .. } | Self::Json(_) => 400,

            // 404 Not Found
            Self::ViewNotFound(_) => 404,

            // 409 Conflict
            Self::VersionConflict { .. } | Self::ViewAlreadyExists(_) => 409,

            // 422 Unprocessable Entity
            Self::Compilation { .. } => 422,

            // 502 Bad Gateway
            Self::Estimation(_) | Self::Execution(_) => 502,

            // 503 Service Unavailable
            Self::Pool(_) => 503,

            // 504 Gateway Timeout
            Self::ExecutionTimeout { .. } => 504,

            // 500 Internal Server Error
            Self::Config(_) | Self::Internal(_) | Self::Io(_) => 500,
        }
    }

    /// Stable error code for API responses
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_error",
            Self::Compilation { .. } => "compilation_error",
            Self::Estimation(_) => "estimation_error",
            Self::ExecutionTimeout { .. } => "execution_timeout",
            Self::Execution(_) => "execution_error",
            Self::Pool(_) => "pool_error",
            Self::VersionConflict { .. } => "version_conflict",
            Self::ViewNotFound(_) => "view_not_found",
            Self::ViewAlreadyExists(_) => "view_already_exists",
            Self::Config(_) => "config_error",
            Self::Internal(_) => "internal_error",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
        }
    }

    /// Whether the caller may retry the same request unchanged (with backoff).
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Estimation(_)
                | Self::ExecutionTimeout { .. }
                | Self::Execution(_)
                | Self::Pool(_)
                | Self::VersionConflict { .. }
        )
    }

    /// Field path the error refers to, if any.
    #[must_use]
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::Validation { field, .. } | Self::Compilation { field, .. } => Some(field),
            _ => None,
        }
    }
}

impl From<&Error> for ApiError {
    fn from(err: &Error) -> Self {
        let api = ApiError::new(err.error_code(), err.to_string());
        let api = match err.field() {
            Some(field) => api.with_field(field),
            None => api,
        };
        match err {
            Error::VersionConflict { .. } => api.with_hint("Fetch the latest version and retry"),
            Error::ExecutionTimeout { .. } => api.with_hint("Narrow the query or raise the timeout"),
            _ => api,
        }
    }
}
