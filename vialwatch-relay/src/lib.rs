//! vialwatch-relay library
//!
//! HTTP relay between the browser and the external vial analysis program:
//! upload intake, supervised launch, per-client log tails, result retrieval
//! and cleanup. Exposed as a library for integration testing.

pub mod api;
pub mod cleanup;
pub mod error;
pub mod intake;
pub mod launcher;
pub mod results;
pub mod tail;

pub use crate::error::{ApiError, ApiResult};

use axum::extract::DefaultBodyLimit;
use axum::Router;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use vialwatch_common::{ClientIdGenerator, RelayConfig};

use crate::launcher::JobLauncher;
use crate::tail::{SessionRegistry, TailSettings};

/// Room for the non-file form fields on top of the image cap
const FORM_OVERHEAD_BYTES: usize = 1024 * 1024;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RelayConfig>,
    /// Per-client sessions: log tails, job state, system log
    pub sessions: SessionRegistry,
    pub launcher: JobLauncher,
    pub ids: Arc<ClientIdGenerator>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Self {
        let sessions = SessionRegistry::new(TailSettings::from_config(&config));
        let launcher = JobLauncher::new(&config, sessions.clone());
        Self {
            config: Arc::new(config),
            sessions,
            launcher,
            ids: Arc::new(ClientIdGenerator::new()),
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    let body_limit = state.config.upload.max_bytes as usize + FORM_OVERHEAD_BYTES;

    Router::new()
        .merge(api::ui_routes())
        .merge(api::upload_routes())
        .merge(api::status_routes())
        .merge(api::results_routes())
        .merge(api::cleanup_routes())
        .merge(api::health_routes())
        .fallback(api::not_found)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Create the directories the relay and the analysis program share
pub async fn prepare_directories(config: &RelayConfig) -> std::io::Result<()> {
    for dir in [
        config.upload_dir(),
        config.log_dir(),
        config.images_dir(),
        config.raw_data_dir(),
    ] {
        if !tokio::fs::try_exists(&dir).await? {
            tokio::fs::create_dir_all(&dir).await?;
            tracing::info!(dir = %dir.display(), "Created directory");
        }
    }
    Ok(())
}
