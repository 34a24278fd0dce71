//! Cleanup endpoint

use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use chrono::Local;
use serde::Serialize;
use std::time::Duration;
use tracing::info;

use super::parse_client_id;
use crate::cleanup::{cleanup_logs, CleanupTarget};
use crate::error::ApiResult;
use crate::tail::session_window_start;
use crate::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupResponse {
    pub success: bool,
    pub message: String,
    pub deleted_files: usize,
}

/// POST /cleanup/:client_id
///
/// Releases the client's session, waits for the follower to let go of the
/// file, then deletes the rotated log files in scope. Files other sessions
/// still follow are left alone.
pub async fn cleanup(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> ApiResult<Json<CleanupResponse>> {
    let client_id = parse_client_id(&client_id)?;

    let followed = state.sessions.log_file(&client_id).await;
    let released = state.sessions.release(&client_id).await;
    if released && state.config.cleanup.settle_ms > 0 {
        tokio::time::sleep(Duration::from_millis(state.config.cleanup.settle_ms)).await;
    }

    let window = session_window_start(&client_id).map(|start| (start, Local::now().naive_local()));
    let target = CleanupTarget {
        scope: state.config.cleanup.scope,
        window,
        followed,
        protected: state.sessions.followed_files().await,
    };
    let settings = state.sessions.settings();
    let report = cleanup_logs(&settings.log_dir, &settings.naming, &target).await?;

    info!(
        client_id = %client_id,
        released,
        deleted = report.deleted_count(),
        "Cleanup complete"
    );
    Ok(Json(CleanupResponse {
        success: true,
        message: format!("Deleted {} log file(s)", report.deleted_count()),
        deleted_files: report.deleted_count(),
    }))
}

/// Build cleanup routes
pub fn cleanup_routes() -> Router<AppState> {
    Router::new().route("/cleanup/:client_id", post(cleanup))
}
