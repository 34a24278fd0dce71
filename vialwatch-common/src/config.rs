//! Configuration loading
//!
//! Resolution priority (highest first):
//! 1. Command-line arguments (applied by the binary after loading)
//! 2. Environment variables (`VIALWATCH_*`)
//! 3. TOML config file (`--config`, `VIALWATCH_CONFIG`, or the platform default)
//! 4. Compiled defaults
//!
//! A missing default config file is not an error: the relay logs a warning
//! and starts with compiled defaults. An explicitly named file must exist.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::{AnalysisParameters, Error, Result, RetryPolicy, StatusMarkers};

/// Environment variable naming an explicit config file
pub const ENV_CONFIG_PATH: &str = "VIALWATCH_CONFIG";

/// Full relay configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub paths: PathsConfig,
    pub analysis: AnalysisConfig,
    pub upload: UploadConfig,
    pub tail: TailConfig,
    pub results: ResultsConfig,
    pub markers: StatusMarkers,
    pub cleanup: CleanupConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

/// Filesystem layout shared with the analysis program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Working directory of the analysis program
    pub analysis_root: PathBuf,
    /// Rotated log files (default: `<analysis_root>/logs`)
    pub log_dir: Option<PathBuf>,
    /// Output tree (default: `<analysis_root>/output`)
    pub output_dir: Option<PathBuf>,
    /// Where accepted uploads are written
    pub upload_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            analysis_root: PathBuf::from("../HeinSight3.0"),
            log_dir: None,
            output_dir: None,
            upload_dir: PathBuf::from("uploads"),
        }
    }
}

/// External analysis command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Executable to run
    pub program: String,
    /// Arguments placed before the per-run flags (usually the script path)
    pub args: Vec<String>,
    /// Kill the program after this many seconds
    pub timeout_secs: u64,
    /// Parameters used when the upload form omits them
    pub defaults: AnalysisParameters,
    /// Image files the program is expected to write into the image directory
    pub expected_images: Vec<String>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["main.py".to_string()],
            timeout_secs: 300,
            defaults: AnalysisParameters::default(),
            expected_images: vec!["output.jpg".to_string(), "turbidites.jpg".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub max_bytes: u64,
    pub allowed_mime_types: Vec<String>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024,
            allowed_mime_types: vec![
                "image/jpeg".to_string(),
                "image/png".to_string(),
                "image/jpg".to_string(),
            ],
        }
    }
}

/// Log discovery and follow settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TailConfig {
    /// File name prefix of rotated logs
    pub log_prefix: String,
    /// chrono format of the timestamp following the prefix
    pub timestamp_format: String,
    /// Buffered lines per session
    pub capacity: usize,
    /// How often a follower checks the file for new data
    pub follow_interval_ms: u64,
    /// Wait budget for a fresh log file to appear
    pub discovery: RetryPolicy,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            log_prefix: "instance_seg.log_".to_string(),
            timestamp_format: "%Y-%m-%d-%H-%M-%S".to_string(),
            capacity: crate::log_buffer::TAIL_CAPACITY,
            follow_interval_ms: 250,
            discovery: RetryPolicy::log_discovery(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultsConfig {
    /// Subdirectory of the output tree holding rendered images
    pub images_dir_name: String,
    /// Subdirectory of the output tree holding raw data
    pub raw_data_dir_name: String,
    /// Volume result file inside the raw data directory
    pub volume_file: String,
    /// Wait budget for the volume result file
    pub volume_retry: RetryPolicy,
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self {
            images_dir_name: "insseg".to_string(),
            raw_data_dir_name: "raw_data".to_string(),
            volume_file: "volume_data.json".to_string(),
            volume_retry: RetryPolicy::volume_result(),
        }
    }
}

/// Which rotated log files cleanup removes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupScope {
    /// Only files stamped inside the client's session window
    Session,
    /// Every rotated log file, regardless of client
    All,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub scope: CleanupScope,
    /// Pause between stopping the follower and deleting files
    pub settle_ms: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            scope: CleanupScope::Session,
            settle_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default tracing level when RUST_LOG is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Platform config file location (`~/.config/vialwatch/vialwatch.toml` on Linux)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("vialwatch").join("vialwatch.toml"))
}

impl RelayConfig {
    /// Resolve configuration from file, environment and defaults
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let named = explicit_path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(ENV_CONFIG_PATH).ok().map(PathBuf::from));

        let mut config = match named {
            Some(path) => Self::from_file(&path)?,
            None => match default_config_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(&path)?,
                None => {
                    warn!("No config file found, using compiled defaults");
                    Self::default()
                }
            },
        };

        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Read config {} failed: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&content)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))
    }

    /// Apply `VIALWATCH_*` overrides using `lookup` to read variables
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("VIALWATCH_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("VIALWATCH_PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| Error::Config(format!("VIALWATCH_PORT is not a port: {}", port)))?;
        }
        if let Some(root) = lookup("VIALWATCH_ANALYSIS_ROOT") {
            self.paths.analysis_root = PathBuf::from(root);
        }
        if let Some(dir) = lookup("VIALWATCH_LOG_DIR") {
            self.paths.log_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = lookup("VIALWATCH_OUTPUT_DIR") {
            self.paths.output_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = lookup("VIALWATCH_UPLOAD_DIR") {
            self.paths.upload_dir = PathBuf::from(dir);
        }
        if let Some(program) = lookup("VIALWATCH_PROGRAM") {
            self.analysis.program = program;
        }
        if let Some(secs) = lookup("VIALWATCH_JOB_TIMEOUT_SECS") {
            self.analysis.timeout_secs = secs.parse().map_err(|_| {
                Error::Config(format!("VIALWATCH_JOB_TIMEOUT_SECS is not a number: {}", secs))
            })?;
        }
        if let Some(level) = lookup("VIALWATCH_LOG_LEVEL") {
            self.logging.level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.analysis.program.trim().is_empty() {
            return Err(Error::Config("analysis.program must not be empty".to_string()));
        }
        if self.upload.max_bytes == 0 {
            return Err(Error::Config("upload.max_bytes must be positive".to_string()));
        }
        if self.tail.log_prefix.is_empty() {
            return Err(Error::Config("tail.log_prefix must not be empty".to_string()));
        }
        if self.tail.capacity == 0 {
            return Err(Error::Config("tail.capacity must be positive".to_string()));
        }
        self.analysis
            .defaults
            .validate()
            .map_err(|e| Error::Config(format!("analysis.defaults: {}", e)))?;
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.paths
            .log_dir
            .clone()
            .unwrap_or_else(|| self.paths.analysis_root.join("logs"))
    }

    pub fn output_dir(&self) -> PathBuf {
        self.paths
            .output_dir
            .clone()
            .unwrap_or_else(|| self.paths.analysis_root.join("output"))
    }

    pub fn images_dir(&self) -> PathBuf {
        self.output_dir().join(&self.results.images_dir_name)
    }

    pub fn raw_data_dir(&self) -> PathBuf {
        self.output_dir().join(&self.results.raw_data_dir_name)
    }

    pub fn volume_file_path(&self) -> PathBuf {
        self.raw_data_dir().join(&self.results.volume_file)
    }

    pub fn upload_dir(&self) -> PathBuf {
        self.paths.upload_dir.clone()
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.analysis.timeout_secs)
    }

    pub fn follow_interval(&self) -> Duration {
        Duration::from_millis(self.tail.follow_interval_ms)
    }

    /// Point every directory at `root`, as tests and sandboxes do
    pub fn rooted_at(root: &Path) -> Self {
        let mut config = Self::default();
        config.paths.analysis_root = root.join("analysis");
        config.paths.upload_dir = root.join("uploads");
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_layout() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_address(), "127.0.0.1:3000");
        assert_eq!(config.log_dir(), PathBuf::from("../HeinSight3.0/logs"));
        assert_eq!(
            config.volume_file_path(),
            PathBuf::from("../HeinSight3.0/output/raw_data/volume_data.json")
        );
        assert_eq!(config.images_dir(), PathBuf::from("../HeinSight3.0/output/insseg"));
        assert_eq!(config.upload.max_bytes, 10 * 1024 * 1024);
        assert_eq!(config.tail.capacity, 1000);
        assert_eq!(config.cleanup.scope, CleanupScope::Session);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = RelayConfig::from_toml_str(
            r#"
            [server]
            port = 8080

            [paths]
            log_dir = "/var/log/heinsight"

            [cleanup]
            scope = "all"

            [tail.discovery]
            interval_ms = 100
            max_attempts = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.log_dir(), PathBuf::from("/var/log/heinsight"));
        assert_eq!(config.cleanup.scope, CleanupScope::All);
        assert_eq!(config.tail.discovery, RetryPolicy::fixed(100, 5));
        assert_eq!(config.analysis.program, "python3");
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = RelayConfig::from_toml_str("[server\nport = ").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("VIALWATCH_PORT", "9000"),
            ("VIALWATCH_ANALYSIS_ROOT", "/opt/heinsight"),
            ("VIALWATCH_PROGRAM", "/usr/bin/python3.11"),
        ]
        .into_iter()
        .collect();

        let mut config = RelayConfig::default();
        config
            .apply_env_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.log_dir(), PathBuf::from("/opt/heinsight/logs"));
        assert_eq!(config.analysis.program, "/usr/bin/python3.11");
    }

    #[test]
    fn test_bad_port_override_rejected() {
        let mut config = RelayConfig::default();
        let err = config
            .apply_env_overrides(|k| (k == "VIALWATCH_PORT").then(|| "http".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_invalid_defaults_rejected() {
        let mut config = RelayConfig::default();
        config.analysis.defaults.batch_size = 0;
        assert!(config.validate().is_err());
    }
}
