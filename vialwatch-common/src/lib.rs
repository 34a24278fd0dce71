//! # vialwatch common library
//!
//! Shared code for the vialwatch relay and its clients:
//! - Error type
//! - Configuration loading
//! - Client identifiers
//! - Bounded log buffers and status classification
//! - Retry policy for bounded polling waits
//! - Volume result model and rendering
//! - Client-side run state machine

pub mod client_id;
pub mod config;
pub mod error;
pub mod log_buffer;
pub mod monitor;
pub mod params;
pub mod retry;
pub mod status;
pub mod volume;

pub use client_id::{ClientId, ClientIdGenerator};
pub use config::RelayConfig;
pub use error::{Error, Result};
pub use log_buffer::LogBuffer;
pub use params::AnalysisParameters;
pub use retry::RetryPolicy;
pub use status::{classify_line, JobStatus, StatusMarkers};
