//! Client-side run state machine
//!
//! One analysis run moves `Idle → FileSelected → Uploading → Polling` and
//! ends in `Completed` or `Failed`. The monitor owns the polling budget: a
//! hard wall-clock timeout and a cap on consecutive failed polls. Time is
//! passed in by the caller so the machine is deterministic under test.

use serde::Deserialize;
use std::time::{Duration, Instant};

use crate::{ClientId, Error, JobStatus, Result, StatusMarkers};

/// Polling budget for one run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitorPolicy {
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub max_consecutive_failures: u32,
}

impl Default for MonitorPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(300),
            max_consecutive_failures: 3,
        }
    }
}

/// Subset of the status endpoint's response the client cares about
#[derive(Debug, Clone, Deserialize)]
pub struct StatusReport {
    pub status: JobStatus,
    #[serde(default)]
    pub logs: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunPhase {
    Idle,
    FileSelected { file_name: String, mime: String },
    Uploading,
    Polling { client_id: ClientId, started: Instant },
    Completed { client_id: ClientId },
    Failed { reason: String },
}

/// What the caller should do after a poll
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Sleep `poll_interval` and poll again
    Continue,
    /// Fetch images and volume data, then clean up
    Completed,
    /// Stop polling and show the reason inline
    Failed(String),
}

#[derive(Debug)]
pub struct RunMonitor {
    policy: MonitorPolicy,
    markers: StatusMarkers,
    phase: RunPhase,
    consecutive_failures: u32,
}

impl RunMonitor {
    pub fn new(policy: MonitorPolicy, markers: StatusMarkers) -> Self {
        Self {
            policy,
            markers,
            phase: RunPhase::Idle,
            consecutive_failures: 0,
        }
    }

    pub fn phase(&self) -> &RunPhase {
        &self.phase
    }

    pub fn policy(&self) -> &MonitorPolicy {
        &self.policy
    }

    pub fn client_id(&self) -> Option<&ClientId> {
        match &self.phase {
            RunPhase::Polling { client_id, .. } | RunPhase::Completed { client_id } => {
                Some(client_id)
            }
            _ => None,
        }
    }

    /// Pick a file; only image MIME types enable the start action
    pub fn select_file(&mut self, file_name: &str, mime: &str) -> Result<()> {
        if matches!(self.phase, RunPhase::Uploading | RunPhase::Polling { .. }) {
            return Err(Error::InvalidInput("a run is already in progress".to_string()));
        }
        if !mime.starts_with("image/") {
            return Err(Error::InvalidInput(format!(
                "only image files can be selected (got {})",
                mime
            )));
        }
        self.phase = RunPhase::FileSelected {
            file_name: file_name.to_string(),
            mime: mime.to_string(),
        };
        Ok(())
    }

    pub fn begin_upload(&mut self) -> Result<()> {
        match self.phase {
            RunPhase::FileSelected { .. } => {
                self.phase = RunPhase::Uploading;
                Ok(())
            }
            _ => Err(Error::InvalidInput("no file selected".to_string())),
        }
    }

    pub fn upload_accepted(&mut self, client_id: ClientId, now: Instant) -> Result<()> {
        if self.phase != RunPhase::Uploading {
            return Err(Error::InvalidInput("no upload in flight".to_string()));
        }
        self.consecutive_failures = 0;
        self.phase = RunPhase::Polling {
            client_id,
            started: now,
        };
        Ok(())
    }

    pub fn upload_failed(&mut self, reason: impl Into<String>) {
        self.phase = RunPhase::Failed {
            reason: reason.into(),
        };
    }

    /// Feed one poll result into the machine
    ///
    /// `Err` is a failed fetch or an unparsable response. A `not_found`
    /// status also counts as a failed poll since it carries no logs.
    pub fn observe(&mut self, poll: std::result::Result<StatusReport, String>, now: Instant) -> PollOutcome {
        let RunPhase::Polling { client_id, started } = &self.phase else {
            return match &self.phase {
                RunPhase::Completed { .. } => PollOutcome::Completed,
                RunPhase::Failed { reason } => PollOutcome::Failed(reason.clone()),
                _ => PollOutcome::Failed("not polling".to_string()),
            };
        };
        let client_id = client_id.clone();
        let started = *started;

        let failure = match poll {
            Ok(StatusReport {
                status,
                logs: Some(logs),
            }) if status != JobStatus::NotFound => {
                self.consecutive_failures = 0;
                let lines = || logs.iter().map(String::as_str);

                if status == JobStatus::Completed || self.markers.any_completion(lines()) {
                    self.phase = RunPhase::Completed { client_id };
                    return PollOutcome::Completed;
                }
                if status == JobStatus::Error || self.markers.any_error(lines()) {
                    return self.fail("the analysis reported an error".to_string());
                }
                None
            }
            Ok(report) => Some(format!("status unavailable ({:?})", report.status)),
            Err(e) => Some(e),
        };

        if let Some(reason) = failure {
            self.consecutive_failures += 1;
            tracing::warn!(
                client_id = %client_id,
                failures = self.consecutive_failures,
                reason = %reason,
                "Status poll failed"
            );
            if self.consecutive_failures > self.policy.max_consecutive_failures {
                return self.fail(reason);
            }
        }

        if now.saturating_duration_since(started) > self.policy.timeout {
            return self.fail("processing timed out".to_string());
        }

        PollOutcome::Continue
    }

    /// Result fetch or rendering failed after completion was detected
    pub fn result_failed(&mut self, reason: impl Into<String>) {
        self.phase = RunPhase::Failed {
            reason: reason.into(),
        };
    }

    fn fail(&mut self, reason: String) -> PollOutcome {
        self.phase = RunPhase::Failed {
            reason: reason.clone(),
        };
        PollOutcome::Failed(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(status: JobStatus, logs: &[&str]) -> StatusReport {
        StatusReport {
            status,
            logs: Some(logs.iter().map(|s| s.to_string()).collect()),
        }
    }

    fn polling_monitor(now: Instant) -> RunMonitor {
        let mut monitor = RunMonitor::new(MonitorPolicy::default(), StatusMarkers::default());
        monitor.select_file("vials.jpg", "image/jpeg").unwrap();
        monitor.begin_upload().unwrap();
        monitor
            .upload_accepted(ClientId::from_millis(1_700_000_000_000), now)
            .unwrap();
        monitor
    }

    #[test]
    fn test_happy_path_transitions() {
        let now = Instant::now();
        let mut monitor = polling_monitor(now);

        assert_eq!(
            monitor.observe(Ok(report(JobStatus::Processing, &["loading model"])), now),
            PollOutcome::Continue
        );
        assert_eq!(
            monitor.observe(
                Ok(report(JobStatus::Processing, &["Detections saved at out/"])),
                now
            ),
            PollOutcome::Completed
        );
        assert!(matches!(monitor.phase(), RunPhase::Completed { .. }));
        assert!(monitor.client_id().is_some());
    }

    #[test]
    fn test_non_image_selection_rejected() {
        let mut monitor = RunMonitor::new(MonitorPolicy::default(), StatusMarkers::default());
        assert!(monitor.select_file("notes.txt", "text/plain").is_err());
        assert_eq!(monitor.phase(), &RunPhase::Idle);
        assert!(monitor.begin_upload().is_err());
    }

    #[test]
    fn test_error_status_fails_immediately() {
        let now = Instant::now();
        let mut monitor = polling_monitor(now);
        let outcome = monitor.observe(Ok(report(JobStatus::Error, &["boom"])), now);
        assert!(matches!(outcome, PollOutcome::Failed(_)));
    }

    #[test]
    fn test_fails_after_consecutive_failure_budget() {
        let now = Instant::now();
        let mut monitor = polling_monitor(now);

        for _ in 0..3 {
            assert_eq!(
                monitor.observe(Err("503".to_string()), now),
                PollOutcome::Continue
            );
        }
        assert!(matches!(
            monitor.observe(Err("503".to_string()), now),
            PollOutcome::Failed(_)
        ));
    }

    #[test]
    fn test_successful_poll_resets_failure_counter() {
        let now = Instant::now();
        let mut monitor = polling_monitor(now);

        for _ in 0..3 {
            monitor.observe(Err("timeout".to_string()), now);
        }
        monitor.observe(Ok(report(JobStatus::Processing, &["step"])), now);
        for _ in 0..3 {
            assert_eq!(
                monitor.observe(Err("timeout".to_string()), now),
                PollOutcome::Continue
            );
        }
    }

    #[test]
    fn test_not_found_counts_as_failure() {
        let now = Instant::now();
        let mut monitor = polling_monitor(now);
        let not_found = StatusReport {
            status: JobStatus::NotFound,
            logs: None,
        };
        for _ in 0..3 {
            monitor.observe(Ok(not_found.clone()), now);
        }
        assert!(matches!(
            monitor.observe(Ok(not_found), now),
            PollOutcome::Failed(_)
        ));
    }

    #[test]
    fn test_wall_clock_timeout() {
        let start = Instant::now();
        let mut monitor = polling_monitor(start);
        let later = start + Duration::from_secs(301);
        assert_eq!(
            monitor.observe(Ok(report(JobStatus::Processing, &["still going"])), later),
            PollOutcome::Failed("processing timed out".to_string())
        );
    }
}
