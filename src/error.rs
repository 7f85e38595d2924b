/// Error types for the transcode pipeline
///
/// This module defines all error types that can occur in the service.
/// Errors are converted to appropriate HTTP responses for API clients via
/// the `{error, detail?}` envelope.
use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use serde::Serialize;
use std::fmt;

/// Result type for transcode-pipeline operations
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error types
#[derive(Debug)]
pub enum AppError {
    /// Job Store (database) operation failed
    DatabaseError(String),

    /// Queue & Scheduler operation failed
    QueueError(String),

    /// Validation failed on an inbound request
    ValidationError(String),

    /// Resource not found
    NotFound(String),

    /// Bad request, malformed input
    BadRequest(String),

    /// Conflict — a state transition was attempted from an incompatible
    /// current status
    Conflict(String),

    /// The caller asserted a precondition on a job's current state that
    /// did not hold
    Precondition(String),

    /// Object Store Adapter operation failed (upload, download, presign)
    ObjectStoreError(String),

    /// Encoder Driver failed to produce output, carrying the resolution
    /// and a tail of ffmpeg's stderr
    EncoderError { resolution: String, detail: String },

    /// A job's lock expired twice in a row without progress
    Stalled(String),

    /// Internal server error
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::DatabaseError(msg) => write!(f, "database error: {}", msg),
            AppError::QueueError(msg) => write!(f, "queue error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "validation error: {}", msg),
            AppError::NotFound(msg) => write!(f, "not found: {}", msg),
            AppError::BadRequest(msg) => write!(f, "bad request: {}", msg),
            AppError::Conflict(msg) => write!(f, "conflict: {}", msg),
            AppError::Precondition(msg) => write!(f, "precondition failed: {}", msg),
            AppError::ObjectStoreError(msg) => write!(f, "object store error: {}", msg),
            AppError::EncoderError { resolution, detail } => {
                write!(f, "encoder failed for {}: {}", resolution, detail)
            }
            AppError::Stalled(msg) => write!(f, "stalled: {}", msg),
            AppError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::DatabaseError(_)
            | AppError::QueueError(_)
            | AppError::ObjectStoreError(_)
            | AppError::EncoderError { .. }
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::ValidationError(_) | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) | AppError::Stalled(_) => StatusCode::CONFLICT,
            AppError::Precondition(_) => StatusCode::PRECONDITION_FAILED,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let (error, detail) = match self {
            AppError::ValidationError(msg) | AppError::BadRequest(msg) => {
                ("invalid_request".to_string(), Some(msg.clone()))
            }
            AppError::NotFound(msg) => ("not_found".to_string(), Some(msg.clone())),
            AppError::Conflict(msg) => ("conflict".to_string(), Some(msg.clone())),
            AppError::Precondition(msg) => ("precondition_failed".to_string(), Some(msg.clone())),
            AppError::Stalled(msg) => ("stalled".to_string(), Some(msg.clone())),
            AppError::DatabaseError(_)
            | AppError::QueueError(_)
            | AppError::ObjectStoreError(_)
            | AppError::EncoderError { .. }
            | AppError::Internal(_) => ("internal_error".to_string(), None),
        };

        HttpResponse::build(status).json(ErrorEnvelope { error, detail })
    }
}

impl From<String> for AppError {
    fn from(msg: String) -> Self {
        AppError::Internal(msg)
    }
}

impl From<&str> for AppError {
    fn from(msg: &str) -> Self {
        AppError::Internal(msg.to_string())
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => AppError::NotFound("job not found".to_string()),
            other => AppError::DatabaseError(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        AppError::QueueError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(
            AppError::ValidationError("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::Conflict("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::Precondition("x".into()).status_code(),
            StatusCode::PRECONDITION_FAILED
        );
        assert_eq!(
            AppError::Stalled("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::EncoderError {
                resolution: "720p".into(),
                detail: "boom".into()
            }
            .status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
