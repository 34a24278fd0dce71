//! Result retrieval endpoints
//!
//! Images and raw data are served straight from the analysis output tree,
//! never cached by the browser since every run overwrites the same names.

use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{header, HeaderValue},
    response::Response,
    routing::get,
    Json, Router,
};
use serde_json::Value;
use std::path::Path as FsPath;
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::debug;

use super::parse_client_id;
use crate::error::{ApiError, ApiResult};
use crate::results::{load_volume_result, resolve_output_file};
use crate::AppState;

async fn serve_output_file(dir: &FsPath, filename: &str, request: Request) -> ApiResult<Response> {
    let not_found = || ApiError::NotFound(format!("File not found: {}", filename));

    let path = resolve_output_file(dir, filename).ok_or_else(not_found)?;
    let is_file = tokio::fs::metadata(&path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false);
    if !is_file {
        return Err(not_found());
    }

    debug!(path = %path.display(), "Serving output file");
    let mut response = match ServeFile::new(&path).oneshot(request).await {
        Ok(response) => response.map(Body::new),
        Err(never) => match never {},
    };
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    Ok(response)
}

/// GET /results/:filename
pub async fn get_result_image(
    State(state): State<AppState>,
    Path(filename): Path<String>,
    request: Request,
) -> ApiResult<Response> {
    serve_output_file(&state.config.images_dir(), &filename, request).await
}

/// GET /raw-data/:filename
pub async fn get_raw_data(
    State(state): State<AppState>,
    Path(filename): Path<String>,
    request: Request,
) -> ApiResult<Response> {
    serve_output_file(&state.config.raw_data_dir(), &filename, request).await
}

/// GET /volume-data/:client_id
///
/// The volume file has a fixed path; the client id only tags the request.
pub async fn get_volume_data(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let client_id = parse_client_id(&client_id)?;
    debug!(client_id = %client_id, "Volume data requested");

    let doc = load_volume_result(
        &state.config.volume_file_path(),
        &state.config.results.volume_retry,
    )
    .await?;
    Ok(Json(doc))
}

/// Build result routes
pub fn results_routes() -> Router<AppState> {
    Router::new()
        .route("/results/:filename", get(get_result_image))
        .route("/raw-data/:filename", get(get_raw_data))
        .route("/volume-data/:client_id", get(get_volume_data))
}
