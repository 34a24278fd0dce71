//! Supervised launch of the external analysis program
//!
//! The HTTP caller gets its client id back as soon as the program is
//! scheduled. A supervisor task waits for the program under a timeout and
//! records how it ended in the client's session, where `GET /status` sees it.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use vialwatch_common::log_buffer::LogLevel;
use vialwatch_common::{AnalysisParameters, ClientId, RelayConfig};

use crate::tail::SessionRegistry;

/// Lines of stderr kept when a run fails
const STDERR_TAIL_LINES: usize = 20;

/// How a supervised run is doing
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum JobState {
    Running {
        #[serde(skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
    },
    Succeeded,
    Failed {
        exit_code: Option<i32>,
        stderr_tail: Vec<String>,
    },
    TimedOut {
        after_secs: u64,
    },
    SpawnFailed {
        reason: String,
    },
}

impl JobState {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            JobState::Failed { .. } | JobState::TimedOut { .. } | JobState::SpawnFailed { .. }
        )
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self, JobState::Running { .. })
    }
}

/// Command line of the analysis program
#[derive(Debug, Clone)]
pub struct AnalysisCommand {
    pub program: String,
    /// Arguments placed before the per-run flags
    pub base_args: Vec<String>,
    pub working_dir: PathBuf,
    pub timeout: Duration,
}

impl AnalysisCommand {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            program: config.analysis.program.clone(),
            base_args: config.analysis.args.clone(),
            working_dir: config.paths.analysis_root.clone(),
            timeout: config.job_timeout(),
        }
    }

    /// `<base args> --input_image_path <p> --nms_iou x --conf y --batch_size n --create_plots`
    pub fn build_args(&self, input: &Path, params: &AnalysisParameters) -> Vec<String> {
        let mut args = self.base_args.clone();
        args.push("--input_image_path".to_string());
        args.push(input.display().to_string());
        args.extend(params.to_args());
        args.push("--create_plots".to_string());
        args
    }
}

/// Starts analysis runs and supervises them
#[derive(Clone)]
pub struct JobLauncher {
    command: AnalysisCommand,
    sessions: SessionRegistry,
    images_dir: PathBuf,
    raw_data_dir: PathBuf,
    expected_images: Vec<String>,
}

impl JobLauncher {
    pub fn new(config: &RelayConfig, sessions: SessionRegistry) -> Self {
        Self {
            command: AnalysisCommand::from_config(config),
            sessions,
            images_dir: config.images_dir(),
            raw_data_dir: config.raw_data_dir(),
            expected_images: config.analysis.expected_images.clone(),
        }
    }

    pub fn command(&self) -> &AnalysisCommand {
        &self.command
    }

    /// Schedule a run for `client_id` and return without waiting for it
    ///
    /// The returned handle resolves to the final state; callers may drop it.
    pub async fn launch(
        &self,
        client_id: ClientId,
        input: PathBuf,
        params: AnalysisParameters,
    ) -> JoinHandle<JobState> {
        if let Err(e) = ensure_output_dirs(&self.images_dir, &self.raw_data_dir).await {
            warn!(client_id = %client_id, error = %e, "Failed to create output directories");
        }

        self.sessions
            .record_job(&client_id, JobState::Running { pid: None })
            .await;

        let launcher = self.clone();
        tokio::spawn(async move { launcher.supervise(client_id, input, params).await })
    }

    async fn supervise(&self, client_id: ClientId, input: PathBuf, params: AnalysisParameters) -> JobState {
        let args = self.command.build_args(&input, &params);
        info!(
            client_id = %client_id,
            program = %self.command.program,
            args = ?args,
            working_dir = %self.command.working_dir.display(),
            "Launching analysis"
        );

        let child = Command::new(&self.command.program)
            .args(&args)
            .current_dir(&self.command.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => {
                error!(client_id = %client_id, error = %e, "Failed to start analysis program");
                let state = JobState::SpawnFailed {
                    reason: e.to_string(),
                };
                self.finish(&client_id, state.clone()).await;
                return state;
            }
        };

        self.sessions
            .record_job(&client_id, JobState::Running { pid: child.id() })
            .await;

        // Dropping the future on timeout drops the child, which kills it
        let state = match tokio::time::timeout(self.command.timeout, child.wait_with_output()).await {
            Err(_) => {
                error!(
                    client_id = %client_id,
                    timeout_secs = self.command.timeout.as_secs(),
                    "Analysis timed out and was killed"
                );
                JobState::TimedOut {
                    after_secs: self.command.timeout.as_secs(),
                }
            }
            Ok(Err(e)) => {
                error!(client_id = %client_id, error = %e, "Failed waiting for analysis program");
                JobState::Failed {
                    exit_code: None,
                    stderr_tail: vec![e.to_string()],
                }
            }
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                if !stdout.trim().is_empty() {
                    debug!(client_id = %client_id, stdout = %stdout.trim_end(), "Analysis stdout");
                }
                if output.status.success() {
                    info!(client_id = %client_id, "Analysis finished");
                    JobState::Succeeded
                } else {
                    let stderr_tail = tail_lines(&String::from_utf8_lossy(&output.stderr), STDERR_TAIL_LINES);
                    error!(
                        client_id = %client_id,
                        exit_code = ?output.status.code(),
                        stderr = %stderr_tail.join("\n"),
                        "Analysis failed"
                    );
                    JobState::Failed {
                        exit_code: output.status.code(),
                        stderr_tail,
                    }
                }
            }
        };

        if state == JobState::Succeeded {
            self.check_artifacts(&client_id).await;
        }
        self.finish(&client_id, state.clone()).await;
        state
    }

    async fn check_artifacts(&self, client_id: &ClientId) {
        for name in &self.expected_images {
            let path = self.images_dir.join(name);
            let exists = tokio::fs::try_exists(&path).await.unwrap_or(false);
            if exists {
                info!(client_id = %client_id, file = %name, "Result image present");
            } else {
                warn!(client_id = %client_id, file = %name, "Result image missing");
            }
            let level = if exists { LogLevel::Info } else { LogLevel::Warning };
            let verdict = if exists { "present" } else { "missing" };
            self.sessions
                .push_system(client_id, level, format!("Result image {}: {}", name, verdict))
                .await;
        }
    }

    async fn finish(&self, client_id: &ClientId, state: JobState) {
        let (level, message) = match &state {
            JobState::Succeeded => (LogLevel::Info, "Analysis finished".to_string()),
            JobState::Failed { exit_code, .. } => (
                LogLevel::Error,
                match exit_code {
                    Some(code) => format!("Analysis exited with status {}", code),
                    None => "Analysis terminated abnormally".to_string(),
                },
            ),
            JobState::TimedOut { after_secs } => (
                LogLevel::Error,
                format!("Analysis killed after {}s timeout", after_secs),
            ),
            JobState::SpawnFailed { reason } => (
                LogLevel::Error,
                format!("Analysis could not be started: {}", reason),
            ),
            JobState::Running { .. } => return,
        };
        self.sessions.push_system(client_id, level, message).await;
        self.sessions.record_job(client_id, state).await;
    }
}

/// Create the image and raw data directories if missing
pub async fn ensure_output_dirs(images_dir: &Path, raw_data_dir: &Path) -> std::io::Result<()> {
    for dir in [images_dir, raw_data_dir] {
        if !tokio::fs::try_exists(dir).await? {
            tokio::fs::create_dir_all(dir).await?;
            info!(dir = %dir.display(), "Created output directory");
        }
    }
    Ok(())
}

fn tail_lines(text: &str, count: usize) -> Vec<String> {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let skip = lines.len().saturating_sub(count);
    lines[skip..].iter().map(|l| l.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tail::TailSettings;

    fn command() -> AnalysisCommand {
        AnalysisCommand {
            program: "python3".to_string(),
            base_args: vec!["main.py".to_string()],
            working_dir: PathBuf::from("/opt/heinsight"),
            timeout: Duration::from_secs(300),
        }
    }

    #[test]
    fn test_build_args_matches_program_contract() {
        let args = command().build_args(
            Path::new("/srv/uploads/1714557600000-42.jpg"),
            &AnalysisParameters::default(),
        );
        assert_eq!(
            args,
            vec![
                "main.py",
                "--input_image_path",
                "/srv/uploads/1714557600000-42.jpg",
                "--nms_iou",
                "0.1",
                "--conf",
                "0.2",
                "--batch_size",
                "32",
                "--create_plots",
            ]
        );
    }

    #[test]
    fn test_job_state_serialization() {
        let failed = JobState::Failed {
            exit_code: Some(2),
            stderr_tail: vec!["boom".to_string()],
        };
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["exitCode"], 2);
        assert_eq!(json["stderrTail"][0], "boom");
        assert!(failed.is_failure());
        assert!(!JobState::Succeeded.is_failure());
        assert!(!JobState::Running { pid: None }.is_finished());
    }

    #[test]
    fn test_stderr_tail_keeps_last_lines() {
        let text = (1..=30).map(|i| format!("line {}", i)).collect::<Vec<_>>().join("\n");
        let tail = tail_lines(&text, 20);
        assert_eq!(tail.len(), 20);
        assert_eq!(tail[0], "line 11");
        assert_eq!(tail[19], "line 30");
    }

    #[tokio::test]
    async fn test_missing_program_is_recorded_as_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RelayConfig::rooted_at(dir.path());
        config.analysis.program = "definitely-not-a-real-analysis-program".to_string();
        std::fs::create_dir_all(&config.paths.analysis_root).unwrap();

        let sessions = SessionRegistry::new(TailSettings::from_config(&config));
        let launcher = JobLauncher::new(&config, sessions.clone());
        let id = ClientId::from_millis(1);
        sessions.create(&id).await;

        let handle = launcher
            .launch(id.clone(), dir.path().join("x.jpg"), AnalysisParameters::default())
            .await;
        let state = handle.await.unwrap();
        assert!(matches!(state, JobState::SpawnFailed { .. }));

        let snapshot = sessions.get(&id).await.unwrap();
        assert_eq!(snapshot.job, Some(state));
        assert!(snapshot.system_logs.iter().any(|l| l.contains("[ERROR]")));
        assert!(config.images_dir().is_dir());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_program() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RelayConfig::rooted_at(dir.path());
        config.analysis.program = "sh".to_string();
        config.analysis.args = vec!["-c".to_string(), "sleep 5".to_string()];
        config.analysis.timeout_secs = 1;
        std::fs::create_dir_all(&config.paths.analysis_root).unwrap();

        let sessions = SessionRegistry::new(TailSettings::from_config(&config));
        let launcher = JobLauncher::new(&config, sessions.clone());
        let id = ClientId::from_millis(2);
        sessions.create(&id).await;

        let state = launcher
            .launch(id.clone(), dir.path().join("x.jpg"), AnalysisParameters::default())
            .await
            .await
            .unwrap();
        assert_eq!(state, JobState::TimedOut { after_secs: 1 });
    }
}
