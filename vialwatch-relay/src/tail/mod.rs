//! Per-client log tail registry
//!
//! One `Session` per `ClientId`: the buffered log lines of the analysis
//! program's newest log file, a follower task appending to them, the
//! supervised job state and a small system log. The map is guarded by a
//! single async lock; followers write to their own buffer lock so a slow
//! reader never blocks the registry.

pub mod discovery;
pub mod follower;

use chrono::{DateTime, Local, NaiveDateTime, Timelike, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use vialwatch_common::log_buffer::{LogLevel, SYSTEM_LOG_CAPACITY};
use vialwatch_common::{
    classify_line, ClientId, Error, JobStatus, LogBuffer, RelayConfig, Result, RetryPolicy,
    StatusMarkers,
};

pub use discovery::{find_latest_log_file, list_log_files, LogFileEntry, LogFileNaming};
pub use follower::{load_existing, spawn_follower, FollowerHandle};

use crate::launcher::JobState;

/// Discovery and follow settings shared by every session
#[derive(Debug, Clone)]
pub struct TailSettings {
    pub log_dir: PathBuf,
    pub naming: LogFileNaming,
    pub capacity: usize,
    pub follow_interval: Duration,
    pub discovery: RetryPolicy,
}

impl TailSettings {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            log_dir: config.log_dir(),
            naming: LogFileNaming {
                prefix: config.tail.log_prefix.clone(),
                timestamp_format: config.tail.timestamp_format.clone(),
            },
            capacity: config.tail.capacity,
            follow_interval: config.follow_interval(),
            discovery: config.tail.discovery,
        }
    }
}

/// Local wall-clock second a session started, as log file stamps record it
pub fn session_window_start(client_id: &ClientId) -> Option<NaiveDateTime> {
    let started = client_id.started_at()?;
    let local = started.with_timezone(&Local).naive_local();
    local.with_nanosecond(0)
}

/// Live state of one client
#[derive(Debug)]
pub struct Session {
    pub client_id: ClientId,
    pub created_at: DateTime<Utc>,
    logs: Arc<RwLock<LogBuffer>>,
    system_log: LogBuffer,
    follower: Option<FollowerHandle>,
    job: Option<JobState>,
    log_file: Option<PathBuf>,
    tail_error: Option<String>,
}

impl Session {
    fn new(client_id: ClientId, capacity: usize) -> Self {
        Self {
            client_id,
            created_at: Utc::now(),
            logs: Arc::new(RwLock::new(LogBuffer::new(capacity))),
            system_log: LogBuffer::new(SYSTEM_LOG_CAPACITY),
            follower: None,
            job: None,
            log_file: None,
            tail_error: None,
        }
    }

    fn stop_follower(&mut self) {
        if let Some(follower) = self.follower.take() {
            debug!(client_id = %self.client_id, path = %follower.log_path.display(), "Stopping follower");
            follower.stop();
        }
    }
}

/// Point-in-time copy of a session, safe to serialize
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub client_id: ClientId,
    pub logs: Vec<String>,
    pub system_logs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<JobState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
    pub following: bool,
    /// Why no log file could be followed for this session
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tail_error: Option<String>,
}

/// Status of a snapshot
///
/// A failed job wins. A session whose tail could never attach has no log to
/// read, so the job outcome decides: success completes, anything else is an
/// error. Otherwise the last log line decides.
pub fn derive_status(snapshot: &SessionSnapshot, markers: &StatusMarkers) -> JobStatus {
    if snapshot.job.as_ref().is_some_and(JobState::is_failure) {
        return JobStatus::Error;
    }
    if snapshot.tail_error.is_some() {
        return match snapshot.job {
            Some(JobState::Succeeded) => JobStatus::Completed,
            _ => JobStatus::Error,
        };
    }
    match snapshot.logs.last() {
        Some(line) => classify_line(line, markers),
        None => JobStatus::Processing,
    }
}

/// Result of starting a tail
#[derive(Debug, Clone)]
pub struct TailStarted {
    pub log_file: PathBuf,
    pub initial_lines: usize,
}

/// Keyed store of client sessions
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<ClientId, Session>>>,
    settings: Arc<TailSettings>,
}

impl SessionRegistry {
    pub fn new(settings: TailSettings) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &TailSettings {
        &self.settings
    }

    /// Register an empty session; an existing session for the id is kept
    pub async fn create(&self, client_id: &ClientId) {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(client_id.clone())
            .or_insert_with(|| Session::new(client_id.clone(), self.settings.capacity));
    }

    pub async fn contains(&self, client_id: &ClientId) -> bool {
        self.sessions.read().await.contains_key(client_id)
    }

    /// Locate the newest log file and follow it for `client_id`
    ///
    /// With `not_before` set, only files stamped at or after that second are
    /// accepted and an exhausted wait budget is `NotFound`. Without it the
    /// newest file of any age is followed. Any follower already running for
    /// the id is stopped first.
    pub async fn start_tail(
        &self,
        client_id: &ClientId,
        not_before: Option<NaiveDateTime>,
    ) -> Result<TailStarted> {
        self.begin_tail(client_id, not_before, true).await
    }

    /// Like `start_tail`, but only for a session that still exists
    ///
    /// Used by the upload path, where the session may be cleaned up while
    /// discovery is still waiting for the log file.
    pub async fn attach_tail(
        &self,
        client_id: &ClientId,
        not_before: Option<NaiveDateTime>,
    ) -> Result<TailStarted> {
        self.begin_tail(client_id, not_before, false).await
    }

    async fn begin_tail(
        &self,
        client_id: &ClientId,
        not_before: Option<NaiveDateTime>,
        create: bool,
    ) -> Result<TailStarted> {
        let entry = self.discover(client_id, not_before).await?;
        let (existing, offset) = load_existing(&entry.path).await?;
        let file_name = entry
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let initial_lines = existing.len();

        let mut sessions = self.sessions.write().await;
        if !create && !sessions.contains_key(client_id) {
            return Err(Error::NotFound(format!("Session {} was released", client_id)));
        }
        let session = sessions
            .entry(client_id.clone())
            .or_insert_with(|| Session::new(client_id.clone(), self.settings.capacity));
        session.stop_follower();

        // Sequence numbers carry on from the replaced buffer so open cursors
        // see the whole new buffer
        let next_seq = session.logs.read().await.next_seq();
        let mut buffer = LogBuffer::continuing(self.settings.capacity, next_seq);
        buffer.push_system(LogLevel::Info, "Log monitoring started");
        buffer.push_system(LogLevel::Info, format!("Log file: {}", file_name));
        for line in existing {
            buffer.push(line);
        }
        let logs = Arc::new(RwLock::new(buffer));

        session.follower = Some(spawn_follower(
            client_id.clone(),
            entry.path.clone(),
            offset,
            logs.clone(),
            self.settings.follow_interval,
        ));
        session.logs = logs;
        session.log_file = Some(entry.path.clone());
        session.tail_error = None;
        session
            .system_log
            .push_system(LogLevel::Info, format!("Following {}", file_name));

        info!(
            client_id = %client_id,
            log_file = %entry.path.display(),
            initial_lines,
            "Log tail started"
        );
        Ok(TailStarted {
            log_file: entry.path,
            initial_lines,
        })
    }

    async fn discover(
        &self,
        client_id: &ClientId,
        not_before: Option<NaiveDateTime>,
    ) -> Result<LogFileEntry> {
        let dir = self.settings.log_dir.as_path();
        let naming = &self.settings.naming;

        let fresh = self
            .settings
            .discovery
            .poll("log file discovery", || async move {
                match find_latest_log_file(dir, naming, not_before).await {
                    Ok(Some(entry)) if entry.size > 0 => Some(entry),
                    Ok(_) => None,
                    Err(e) => {
                        warn!(dir = %dir.display(), error = %e, "Failed to scan log directory");
                        None
                    }
                }
            })
            .await;
        if let Some(entry) = fresh {
            return Ok(entry);
        }

        if let Some(start) = not_before {
            return Err(Error::NotFound(format!(
                "No log file stamped at or after {} in {}",
                start,
                dir.display()
            )));
        }

        // A manual stream may follow a file still empty when the budget ran out
        match find_latest_log_file(dir, naming, None).await? {
            Some(entry) => {
                debug!(
                    client_id = %client_id,
                    log_file = %entry.path.display(),
                    "Following empty log file"
                );
                Ok(entry)
            }
            None => Err(Error::NotFound(format!(
                "No log file found in {}",
                dir.display()
            ))),
        }
    }

    /// Stop following and drop the session; true if one existed
    pub async fn release(&self, client_id: &ClientId) -> bool {
        let removed = self.sessions.write().await.remove(client_id);
        match removed {
            Some(mut session) => {
                session.stop_follower();
                info!(client_id = %client_id, "Session released");
                true
            }
            None => false,
        }
    }

    /// Alias of `release`: a stopped tail keeps no buffer
    pub async fn stop(&self, client_id: &ClientId) -> bool {
        self.release(client_id).await
    }

    pub async fn get(&self, client_id: &ClientId) -> Option<SessionSnapshot> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(client_id)?;
        let logs = session.logs.read().await.lines();
        Some(SessionSnapshot {
            client_id: session.client_id.clone(),
            logs,
            system_logs: session.system_log.lines(),
            job: session.job.clone(),
            log_file: session
                .log_file
                .as_deref()
                .and_then(Path::file_name)
                .map(|n| n.to_string_lossy().into_owned()),
            following: session.follower.as_ref().is_some_and(FollowerHandle::is_active),
            tail_error: session.tail_error.clone(),
        })
    }

    /// Lines pushed since `cursor` and the next cursor
    ///
    /// A restart keeps numbering, so a cursor from the replaced buffer yields
    /// the whole new buffer. A cursor past the end rewinds to the start.
    pub async fn logs_since(&self, client_id: &ClientId, cursor: u64) -> Option<(Vec<String>, u64)> {
        let logs = {
            let sessions = self.sessions.read().await;
            sessions.get(client_id)?.logs.clone()
        };
        let buffer = logs.read().await;
        let cursor = if cursor > buffer.next_seq() { 0 } else { cursor };
        Some(buffer.since(cursor))
    }

    /// Record the supervised job state; ignored if the session is gone
    pub async fn record_job(&self, client_id: &ClientId, state: JobState) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(client_id) {
            session.job = Some(state);
        }
    }

    /// Whether the session exists and its job has not finished
    pub async fn job_running(&self, client_id: &ClientId) -> bool {
        self.sessions
            .read()
            .await
            .get(client_id)
            .is_some_and(|s| s.job.as_ref().map_or(true, |job| !job.is_finished()))
    }

    /// Record that no log file could be followed; ignored if the session is gone
    pub async fn record_tail_error(&self, client_id: &ClientId, reason: impl Into<String>) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(client_id) {
            let reason = reason.into();
            session
                .system_log
                .push_system(LogLevel::Error, format!("Log tail unavailable: {}", reason));
            session.tail_error = Some(reason);
        }
    }

    pub async fn push_system(&self, client_id: &ClientId, level: LogLevel, message: impl AsRef<str>) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(client_id) {
            session.system_log.push_system(level, message);
        }
    }

    /// Log file currently followed for `client_id`
    pub async fn log_file(&self, client_id: &ClientId) -> Option<PathBuf> {
        self.sessions.read().await.get(client_id)?.log_file.clone()
    }

    /// Log files followed by any registered session
    pub async fn followed_files(&self) -> HashSet<PathBuf> {
        self.sessions
            .read()
            .await
            .values()
            .filter_map(|s| s.log_file.clone())
            .collect()
    }

    pub async fn active_followers(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.follower.as_ref().is_some_and(FollowerHandle::is_active))
            .count()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Stop every follower; used on shutdown
    pub async fn release_all(&self) {
        let mut sessions = self.sessions.write().await;
        for (_, mut session) in sessions.drain() {
            session.stop_follower();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vialwatch_common::StatusMarkers;

    fn snapshot(logs: &[&str], job: Option<JobState>) -> SessionSnapshot {
        SessionSnapshot {
            client_id: ClientId::from_millis(1),
            logs: logs.iter().map(|s| s.to_string()).collect(),
            system_logs: Vec::new(),
            job,
            log_file: None,
            following: false,
            tail_error: None,
        }
    }

    #[test]
    fn test_status_from_last_line() {
        let markers = StatusMarkers::default();
        assert_eq!(derive_status(&snapshot(&[], None), &markers), JobStatus::Processing);
        assert_eq!(
            derive_status(&snapshot(&["loading", "처리가 완료되었습니다."], None), &markers),
            JobStatus::Completed
        );
        assert_eq!(
            derive_status(&snapshot(&["오류가 발생했습니다.", "retrying"], None), &markers),
            JobStatus::Processing
        );
    }

    #[test]
    fn test_failed_job_forces_error() {
        let markers = StatusMarkers::default();
        let failed = JobState::Failed {
            exit_code: Some(1),
            stderr_tail: vec!["Traceback".to_string()],
        };
        assert_eq!(
            derive_status(&snapshot(&["step 3/10"], Some(failed)), &markers),
            JobStatus::Error
        );
        assert_eq!(
            derive_status(&snapshot(&["step 3/10"], Some(JobState::Succeeded)), &markers),
            JobStatus::Processing
        );
    }

    #[test]
    fn test_unattached_tail_follows_job_outcome() {
        let markers = StatusMarkers::default();
        let unattached = |job| SessionSnapshot {
            tail_error: Some("No log file found".to_string()),
            ..snapshot(&[], job)
        };

        assert_eq!(
            derive_status(&unattached(Some(JobState::Succeeded)), &markers),
            JobStatus::Completed
        );
        assert_eq!(
            derive_status(&unattached(Some(JobState::Running { pid: Some(7) })), &markers),
            JobStatus::Error
        );
        assert_eq!(derive_status(&unattached(None), &markers), JobStatus::Error);
    }

    #[test]
    fn test_window_start_truncates_to_second() {
        let id = ClientId::from_millis(1_714_557_603_789);
        let start = session_window_start(&id).unwrap();
        assert_eq!(start.nanosecond(), 0);
        assert!(session_window_start(&"manual".parse().unwrap()).is_none());
    }
}
