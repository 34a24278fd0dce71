//! Image upload and analysis launch
//!
//! POST /upload accepts the image, registers a session under a fresh client
//! id, launches the analysis program and attaches the session's log tail in
//! the background. The response does not wait for any of that.

use axum::{
    extract::{Multipart, State},
    routing::post,
    Json, Router,
};
use serde::Serialize;
use tracing::{debug, info, warn};
use vialwatch_common::log_buffer::LogLevel;
use vialwatch_common::{ClientId, Error};

use crate::error::ApiResult;
use crate::intake::{self, UploadPolicy};
use crate::tail::{session_window_start, SessionRegistry};
use crate::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub message: String,
    pub client_id: ClientId,
}

/// POST /upload
pub async fn upload(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<Json<UploadResponse>> {
    let policy = UploadPolicy::from_config(&state.config.upload);
    let request = intake::read_upload(
        multipart,
        &policy,
        state.config.analysis.defaults,
        &state.config.upload_dir(),
    )
    .await?;

    let client_id = state.ids.next();
    state.sessions.create(&client_id).await;
    state
        .sessions
        .push_system(
            &client_id,
            LogLevel::Info,
            format!(
                "Upload received: {} ({} bytes)",
                request.file.original_name, request.file.size
            ),
        )
        .await;

    info!(
        client_id = %client_id,
        stored = %request.file.stored_name,
        nms_iou = request.parameters.nms_iou,
        confidence = request.parameters.confidence,
        batch_size = request.parameters.batch_size,
        "Analysis requested"
    );

    // Supervisor handle is not awaited; its outcome lands in the session
    let _ = state
        .launcher
        .launch(client_id.clone(), request.file.path.clone(), request.parameters)
        .await;

    tokio::spawn(attach_run_tail(state.sessions.clone(), client_id.clone()));

    Ok(Json(UploadResponse {
        message: "Image analysis started".to_string(),
        client_id,
    }))
}

/// Follow the log file of a freshly launched run
///
/// Only files stamped at or after the session start qualify. Discovery is
/// retried for as long as the job runs; once it has finished without a log
/// file the failure is recorded on the session.
async fn attach_run_tail(sessions: SessionRegistry, client_id: ClientId) {
    let not_before = session_window_start(&client_id);

    loop {
        let job_was_running = sessions.job_running(&client_id).await;
        match sessions.attach_tail(&client_id, not_before).await {
            Ok(_) => return,
            Err(Error::NotFound(reason)) if job_was_running => {
                debug!(client_id = %client_id, reason = %reason, "Run log not there yet, retrying");
                tokio::time::sleep(sessions.settings().follow_interval).await;
            }
            Err(e) => {
                warn!(client_id = %client_id, error = %e, "Could not attach log tail");
                sessions.record_tail_error(&client_id, e.to_string()).await;
                return;
            }
        }
    }
}

/// Build upload routes
pub fn upload_routes() -> Router<AppState> {
    Router::new().route("/upload", post(upload))
}
