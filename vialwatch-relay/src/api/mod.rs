//! HTTP API handlers for vialwatch-relay

pub mod cleanup;
pub mod health;
pub mod results;
pub mod status;
pub mod ui;
pub mod upload;

pub use cleanup::cleanup_routes;
pub use health::health_routes;
pub use results::results_routes;
pub use status::status_routes;
pub use ui::ui_routes;
pub use upload::upload_routes;

use axum::{http::StatusCode, http::Uri, Json};
use serde_json::{json, Value};
use vialwatch_common::ClientId;

use crate::error::{ApiError, ApiResult};

/// Fallback for unknown routes
pub async fn not_found(uri: Uri) -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "Route not found",
            "requestedPath": uri.path(),
        })),
    )
}

/// Client id from a path segment
pub(crate) fn parse_client_id(raw: &str) -> ApiResult<ClientId> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("Invalid client id: '{}'", raw)))
}
