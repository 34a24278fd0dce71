//! Follow-style reader for a growing log file
//!
//! Each follower is a tokio task that polls the file for new bytes and
//! appends complete lines to a shared `LogBuffer`. It behaves like
//! `tail -F`: a missing file is waited for, and a file that shrinks is
//! treated as replaced and re-read from the start.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use vialwatch_common::{ClientId, LogBuffer};

/// Ticks without new data before an unterminated last line is flushed
const PARTIAL_LINE_FLUSH_TICKS: u32 = 2;

/// Handle to a running follower task
#[derive(Debug)]
pub struct FollowerHandle {
    pub log_path: PathBuf,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl FollowerHandle {
    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled() && !self.task.is_finished()
    }

    /// Stop following; the task exits at its next await point
    pub fn stop(self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

/// Start following `path` from byte `offset`
pub fn spawn_follower(
    client_id: ClientId,
    path: PathBuf,
    offset: u64,
    buffer: Arc<RwLock<LogBuffer>>,
    interval: Duration,
) -> FollowerHandle {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let log_path = path.clone();

    let task = tokio::spawn(async move {
        debug!(client_id = %client_id, path = %path.display(), offset, "Follower started");
        tokio::select! {
            _ = token.cancelled() => {}
            _ = follow(&client_id, &path, offset, buffer, interval) => {}
        }
        debug!(client_id = %client_id, "Follower stopped");
    });

    FollowerHandle {
        log_path,
        cancel,
        task,
    }
}

async fn follow(
    client_id: &ClientId,
    path: &Path,
    mut offset: u64,
    buffer: Arc<RwLock<LogBuffer>>,
    interval: Duration,
) {
    let mut pending: Vec<u8> = Vec::new();
    let mut idle_ticks = 0u32;
    let mut missing_reported = false;

    loop {
        tokio::time::sleep(interval).await;

        let len = match tokio::fs::metadata(path).await {
            Ok(metadata) => {
                missing_reported = false;
                metadata.len()
            }
            Err(e) => {
                if !missing_reported {
                    warn!(client_id = %client_id, path = %path.display(), error = %e, "Followed log file unavailable, waiting");
                    missing_reported = true;
                }
                continue;
            }
        };

        if len < offset {
            debug!(client_id = %client_id, "Log file truncated or replaced, reading from start");
            offset = 0;
            pending.clear();
        }

        if len == offset {
            idle_ticks += 1;
            if !pending.is_empty() && idle_ticks >= PARTIAL_LINE_FLUSH_TICKS {
                let line = String::from_utf8_lossy(&pending).into_owned();
                pending.clear();
                buffer.write().await.push_text(&line);
            }
            continue;
        }
        idle_ticks = 0;

        match read_from(path, offset).await {
            Ok(bytes) => {
                offset += bytes.len() as u64;
                pending.extend_from_slice(&bytes);
                if let Some(last_newline) = pending.iter().rposition(|b| *b == b'\n') {
                    let complete: Vec<u8> = pending.drain(..=last_newline).collect();
                    let text = String::from_utf8_lossy(&complete);
                    buffer.write().await.push_text(&text);
                }
            }
            Err(e) => {
                warn!(client_id = %client_id, error = %e, "Failed to read followed log file");
            }
        }
    }
}

async fn read_from(path: &Path, offset: u64) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).await?;
    Ok(bytes)
}

/// Read existing content up to the last complete line
///
/// Returns the lines and the byte offset a follower should continue from.
pub async fn load_existing(path: &Path) -> std::io::Result<(Vec<String>, u64)> {
    let bytes = tokio::fs::read(path).await?;
    let complete_len = bytes
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|i| i + 1)
        .unwrap_or(0);

    let text = String::from_utf8_lossy(&bytes[..complete_len]);
    let lines = text
        .lines()
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    Ok((lines, complete_len as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    async fn wait_for_lines(buffer: &Arc<RwLock<LogBuffer>>, expected: usize) -> Vec<String> {
        for _ in 0..100 {
            let lines = buffer.read().await.lines();
            if lines.len() >= expected {
                return lines;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        buffer.read().await.lines()
    }

    #[tokio::test]
    async fn test_load_existing_stops_at_partial_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        std::fs::write(&path, "one\ntwo\nthr").unwrap();

        let (lines, offset) = load_existing(&path).await.unwrap();
        assert_eq!(lines, vec!["one", "two"]);
        assert_eq!(offset, 8);
    }

    #[tokio::test]
    async fn test_follows_appended_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        std::fs::write(&path, "existing\n").unwrap();

        let buffer = Arc::new(RwLock::new(LogBuffer::new(100)));
        let handle = spawn_follower(
            ClientId::from_millis(1),
            path.clone(),
            9,
            buffer.clone(),
            Duration::from_millis(10),
        );

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "step 1").unwrap();
        writeln!(file, "step 2").unwrap();

        let lines = wait_for_lines(&buffer, 2).await;
        assert_eq!(lines, vec!["step 1", "step 2"]);
        assert!(handle.is_active());
        handle.stop();
    }

    #[tokio::test]
    async fn test_restarts_after_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        std::fs::write(&path, "a long first line\n").unwrap();

        let buffer = Arc::new(RwLock::new(LogBuffer::new(100)));
        let handle = spawn_follower(
            ClientId::from_millis(1),
            path.clone(),
            18,
            buffer.clone(),
            Duration::from_millis(10),
        );

        std::fs::write(&path, "new\n").unwrap();
        let lines = wait_for_lines(&buffer, 1).await;
        assert_eq!(lines, vec!["new"]);
        handle.stop();
    }

    #[tokio::test]
    async fn test_unterminated_line_is_flushed_when_idle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        std::fs::write(&path, "").unwrap();

        let buffer = Arc::new(RwLock::new(LogBuffer::new(100)));
        let handle = spawn_follower(
            ClientId::from_millis(1),
            path.clone(),
            0,
            buffer.clone(),
            Duration::from_millis(10),
        );

        std::fs::write(&path, "done without newline").unwrap();
        let lines = wait_for_lines(&buffer, 1).await;
        assert_eq!(lines, vec!["done without newline"]);
        handle.stop();
    }
}
