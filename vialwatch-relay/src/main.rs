//! vialwatch-relay - HTTP relay for the vial analysis program
//!
//! Accepts image uploads, launches the analysis program, follows its log
//! files and serves the results to the bundled browser client.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter};
use vialwatch_common::RelayConfig;
use vialwatch_relay::{build_router, prepare_directories, AppState};

#[derive(Parser, Debug)]
#[command(name = "vialwatch-relay")]
#[command(about = "HTTP relay for the vial volume analysis program")]
#[command(version)]
struct Args {
    /// TOML config file (default: platform config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    /// Working directory of the analysis program
    #[arg(long)]
    analysis_root: Option<PathBuf>,

    /// Default tracing level when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn apply(self, config: &mut RelayConfig) {
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(root) = self.analysis_root {
            config.paths.analysis_root = root;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
    }
}

/// Filter directives for a default level when RUST_LOG is unset
fn filter_directives(level: &str) -> String {
    format!("{},tower_http=info", level)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Tracing comes up before the config so loading is logged; the level
    // from the config file is applied once it is known
    let env_filter = EnvFilter::try_from_default_env().ok();
    let from_env = env_filter.is_some();
    let initial_level = args.log_level.clone().unwrap_or_else(|| "info".to_string());
    let (filter, filter_handle) = reload::Layer::new(
        env_filter.unwrap_or_else(|| EnvFilter::new(filter_directives(&initial_level))),
    );
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = RelayConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    args.apply(&mut config);

    if !from_env && config.logging.level != initial_level {
        if let Err(e) = filter_handle.reload(EnvFilter::new(filter_directives(&config.logging.level))) {
            warn!("Failed to apply log level {}: {}", config.logging.level, e);
        }
    }

    info!(
        "Starting vialwatch-relay v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );
    info!("Analysis root: {}", config.paths.analysis_root.display());
    info!("Log directory: {}", config.log_dir().display());
    info!("Output directory: {}", config.output_dir().display());
    info!("Upload directory: {}", config.upload_dir().display());

    prepare_directories(&config)
        .await
        .context("Failed to create working directories")?;

    let address = config.bind_address();
    let state = AppState::new(config);
    let sessions = state.sessions.clone();
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind to {}", address))?;
    info!("vialwatch-relay listening on http://{}", address);
    info!("Health check: http://{}/health", address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    sessions.release_all().await;
    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
