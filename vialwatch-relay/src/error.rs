//! Error types for vialwatch-relay
//!
//! Every filesystem and subprocess failure is converted here into a JSON
//! envelope; no handler error takes the process down.
//!
//! ```json
//! { "error": { "code": "NOT_FOUND", "message": "...", "details": "..." } }
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Request failed validation (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Analysis output exists but cannot be understood (500)
    #[error("Malformed data: {message}")]
    Malformed { message: String, details: String },

    /// Bounded wait exhausted where a timeout is the honest answer (504)
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<vialwatch_common::Error> for ApiError {
    fn from(err: vialwatch_common::Error) -> Self {
        use vialwatch_common::Error;

        match err {
            Error::InvalidInput(msg) => ApiError::BadRequest(msg),
            Error::NotFound(msg) => ApiError::NotFound(msg),
            Error::Malformed(details) => ApiError::Malformed {
                message: "Volume data could not be read".to_string(),
                details,
            },
            Error::Timeout(msg) => ApiError::Timeout(msg),
            Error::Io(e) => ApiError::Io(e),
            Error::Config(msg) | Error::Internal(msg) => ApiError::Internal(msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg, None),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg, None),
            ApiError::Malformed { message, details } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "MALFORMED_DATA",
                message,
                Some(details),
            ),
            ApiError::Timeout(msg) => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT", msg, None),
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "Internal server error".to_string(),
                Some(msg),
            ),
            ApiError::Io(ref err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "IO_ERROR",
                "Filesystem operation failed".to_string(),
                Some(err.to_string()),
            ),
        };

        if status.is_server_error() {
            tracing::error!(code = error_code, message = %message, details = ?details, "Request failed");
        }

        let mut error = json!({
            "code": error_code,
            "message": message,
        });
        if let Some(details) = details {
            error["details"] = json!(details);
        }

        (status, Json(json!({ "error": error }))).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use serde_json::Value;

    async fn body_json(err: ApiError) -> (StatusCode, Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_validation_maps_to_400() {
        let (status, body) = body_json(ApiError::BadRequest("bad mime".into())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "BAD_REQUEST");
        assert_eq!(body["error"]["message"], "bad mime");
        assert!(body["error"].get("details").is_none());
    }

    #[tokio::test]
    async fn test_malformed_carries_details() {
        let err: ApiError =
            vialwatch_common::Error::Malformed("missing 'vials' property".into()).into();
        let (status, body) = body_json(err).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"]["code"], "MALFORMED_DATA");
        assert_eq!(body["error"]["details"], "missing 'vials' property");
    }

    #[tokio::test]
    async fn test_common_not_found_maps_to_404() {
        let err: ApiError = vialwatch_common::Error::NotFound("no log file".into()).into();
        let (status, _) = body_json(err).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
