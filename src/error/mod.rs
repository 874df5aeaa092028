use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::queue::QueueError;

/// Seconds suggested to clients in `Retry-After` when the queue is busy.
const BUSY_RETRY_AFTER_SECONDS: u64 = 1;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(config::ConfigError),

    /// A required setting is absent; fatal at startup
    #[error("Missing required configuration: {0}")]
    ConfigMissing(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

/// Check if running in production mode (based on RUN_MODE env var)
fn is_production() -> bool {
    std::env::var("RUN_MODE")
        .map(|m| m == "production" || m == "prod")
        .unwrap_or(false)
}

impl AppError {
    /// HTTP status and stable error code for this error.
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR"),
            AppError::ConfigMissing(_) => (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_MISSING"),
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            AppError::Queue(e) => {
                let status = match e {
                    QueueError::Busy { .. } => StatusCode::TOO_MANY_REQUESTS,
                    QueueError::StoreUnavailable(_) => StatusCode::BAD_GATEWAY,
                    QueueError::OperationConflict { .. } => StatusCode::SERVICE_UNAVAILABLE,
                    QueueError::InvalidInput(_) => StatusCode::BAD_REQUEST,
                };
                (status, e.kind())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let log_message = self.to_string();

        // Backend details stay server-side in production
        let hide_details = matches!(
            self,
            AppError::Config(_)
                | AppError::Internal(_)
                | AppError::Queue(QueueError::StoreUnavailable(_))
        );
        let client_message = if hide_details && is_production() {
            status
                .canonical_reason()
                .unwrap_or("Internal server error")
                .to_string()
        } else {
            log_message.clone()
        };

        // Always log the detailed error server-side
        if status.is_server_error() {
            tracing::error!(code = %code, status = %status.as_u16(), message = %log_message, "API error");
        } else {
            tracing::warn!(code = %code, status = %status.as_u16(), message = %log_message, "API error");
        }

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message: client_message,
            },
        };

        let mut response = (status, Json(body)).into_response();

        if matches!(self, AppError::Queue(QueueError::Busy { .. })) {
            response.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from(BUSY_RETRY_AFTER_SECONDS),
            );
        }

        response
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_error_status_mapping() {
        let cases = [
            (QueueError::Busy { chunk_key: "c".into() }, StatusCode::TOO_MANY_REQUESTS, "BUSY"),
            (QueueError::StoreUnavailable("down".into()), StatusCode::BAD_GATEWAY, "STORE_UNAVAILABLE"),
            (
                QueueError::OperationConflict { chunk_key: "c".into(), sort_key: "1".into() },
                StatusCode::SERVICE_UNAVAILABLE,
                "OPERATION_CONFLICT",
            ),
            (QueueError::InvalidInput("bad".into()), StatusCode::BAD_REQUEST, "INVALID_INPUT"),
        ];

        for (err, status, code) in cases {
            assert_eq!(AppError::from(err).status_and_code(), (status, code));
        }
    }

    #[test]
    fn test_busy_response_has_retry_after() {
        let response = AppError::from(QueueError::Busy { chunk_key: "c".into() }).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "1");
    }

    #[test]
    fn test_validation_response() {
        let response = AppError::Validation("data is required".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
    }
}
