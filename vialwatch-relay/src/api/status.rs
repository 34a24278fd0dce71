//! Status, progress and log stream endpoints

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::time::Duration;
use tracing::{debug, info};
use vialwatch_common::{ClientId, JobStatus};

use super::parse_client_id;
use crate::error::{ApiError, ApiResult};
use crate::launcher::JobState;
use crate::tail::derive_status;
use crate::AppState;

const STATUS_NOT_FOUND_MESSAGE: &str = "No processing status found for this client";
const PROGRESS_NOT_FOUND_LINE: &str = "Log stream has not started yet or could not be found.";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: JobStatus,
    pub logs: Vec<String>,
    pub system_logs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<JobState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tail_error: Option<String>,
}

/// GET /status/:client_id
///
/// Unknown ids answer `not_found` without a `logs` key.
pub async fn get_status(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> ApiResult<Response> {
    let client_id = parse_client_id(&client_id)?;

    let Some(snapshot) = state.sessions.get(&client_id).await else {
        return Ok(Json(json!({
            "status": JobStatus::NotFound,
            "message": STATUS_NOT_FOUND_MESSAGE,
        }))
        .into_response());
    };

    let status = derive_status(&snapshot, &state.config.markers);
    let response = StatusResponse {
        status,
        logs: snapshot.logs,
        system_logs: snapshot.system_logs,
        job: snapshot.job,
        log_file: snapshot.log_file,
        tail_error: snapshot.tail_error,
    };
    Ok(Json(response).into_response())
}

#[derive(Debug, Default, Deserialize)]
pub struct ProgressQuery {
    /// Cursor from a previous response
    pub since: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ProgressResponse {
    pub logs: Vec<String>,
    /// Pass back as `since` to get only newer lines; absent for unknown ids
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<u64>,
}

/// GET /progress/:client_id[?since=N]
pub async fn get_progress(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
    Query(query): Query<ProgressQuery>,
) -> ApiResult<Json<ProgressResponse>> {
    let client_id = parse_client_id(&client_id)?;
    let response = match state
        .sessions
        .logs_since(&client_id, query.since.unwrap_or(0))
        .await
    {
        Some((logs, cursor)) => ProgressResponse {
            logs,
            cursor: Some(cursor),
        },
        None => ProgressResponse {
            logs: vec![PROGRESS_NOT_FOUND_LINE.to_string()],
            cursor: None,
        },
    };
    Ok(Json(response))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartStreamRequest {
    pub client_id: Option<ClientId>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartStreamResponse {
    pub client_id: ClientId,
}

/// POST /start-log-stream
///
/// Follows the newest log file under the given client id, or under a fresh
/// one when the body is empty or names none.
pub async fn start_log_stream(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<StartStreamResponse>> {
    let request: StartStreamRequest = if body.iter().all(u8::is_ascii_whitespace) {
        StartStreamRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("Invalid log stream request: {}", e)))?
    };
    let client_id = match request.client_id {
        Some(id) => id,
        None => state.ids.next(),
    };

    state.sessions.start_tail(&client_id, None).await?;
    Ok(Json(StartStreamResponse { client_id }))
}

/// POST /stop-log-stream/:client_id
pub async fn stop_log_stream(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let client_id = parse_client_id(&client_id)?;
    let message = if state.sessions.stop(&client_id).await {
        "Log stream stopped"
    } else {
        "No active log stream"
    };
    Ok(Json(json!({ "message": message })))
}

/// GET /progress/:client_id/events
///
/// Streams `log` events for new lines and a `status` event whenever the
/// derived status changes. A `closed` event ends the stream once the
/// session is released.
pub async fn progress_events(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let client_id = parse_client_id(&client_id)?;
    info!(client_id = %client_id, "SSE progress client connected");

    let interval = state.sessions.settings().follow_interval.max(Duration::from_millis(100));
    let stream = async_stream::stream! {
        let mut cursor = 0u64;
        let mut last_status: Option<JobStatus> = None;

        loop {
            let Some((lines, next)) = state.sessions.logs_since(&client_id, cursor).await else {
                debug!(client_id = %client_id, "SSE: session gone, closing stream");
                yield Ok(Event::default().event("closed").data(client_id.to_string()));
                break;
            };
            cursor = next;
            for line in lines {
                yield Ok(Event::default().event("log").data(line));
            }

            if let Some(snapshot) = state.sessions.get(&client_id).await {
                let status = derive_status(&snapshot, &state.config.markers);
                if last_status != Some(status) {
                    last_status = Some(status);
                    if let Ok(data) = serde_json::to_string(&json!({ "status": status, "job": snapshot.job })) {
                        yield Ok(Event::default().event("status").data(data));
                    }
                }
            }

            tokio::time::sleep(interval).await;
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    ))
}

/// Build status and progress routes
pub fn status_routes() -> Router<AppState> {
    Router::new()
        .route("/status/:client_id", get(get_status))
        .route("/start-log-stream", post(start_log_stream))
        .route("/stop-log-stream/:client_id", post(stop_log_stream))
        .route("/progress/:client_id", get(get_progress))
        .route("/progress/:client_id/events", get(progress_events))
}
