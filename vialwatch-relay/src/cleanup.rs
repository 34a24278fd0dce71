//! Rotated log file cleanup
//!
//! Session scope removes the files a run could have produced: those stamped
//! between the session start and the cleanup time, plus the file its tail
//! was following. Global scope removes every rotated log file. Files another
//! live session is following are kept in either scope. A file that cannot be
//! removed is logged and skipped.

use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use vialwatch_common::config::CleanupScope;

use crate::tail::{list_log_files, LogFileNaming};

/// Files the cleanup should consider
#[derive(Debug, Clone)]
pub struct CleanupTarget {
    pub scope: CleanupScope,
    /// Inclusive stamp range of the session
    pub window: Option<(NaiveDateTime, NaiveDateTime)>,
    /// File followed by the session's tail, if any
    pub followed: Option<PathBuf>,
    /// Files still followed by other sessions
    pub protected: HashSet<PathBuf>,
}

impl CleanupTarget {
    fn selects(&self, path: &Path, stamp: Option<NaiveDateTime>) -> bool {
        if self.protected.contains(path) {
            return false;
        }
        match self.scope {
            CleanupScope::All => true,
            CleanupScope::Session => {
                if self.followed.as_deref() == Some(path) {
                    return true;
                }
                match (self.window, stamp) {
                    (Some((start, end)), Some(stamp)) => stamp >= start && stamp <= end,
                    _ => false,
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub deleted: Vec<String>,
    pub failed: usize,
}

impl CleanupReport {
    pub fn deleted_count(&self) -> usize {
        self.deleted.len()
    }
}

/// Delete the rotated log files in `dir` selected by `target`
pub async fn cleanup_logs(
    dir: &Path,
    naming: &LogFileNaming,
    target: &CleanupTarget,
) -> std::io::Result<CleanupReport> {
    let mut report = CleanupReport::default();

    for entry in list_log_files(dir, naming).await? {
        if !target.selects(&entry.path, entry.stamp) {
            debug!(file = %entry.path.display(), "Outside cleanup scope, keeping");
            continue;
        }
        let name = entry
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match tokio::fs::remove_file(&entry.path).await {
            Ok(()) => {
                debug!(file = %name, "Deleted log file");
                report.deleted.push(name);
            }
            Err(e) => {
                warn!(file = %name, error = %e, "Failed to delete log file");
                report.failed += 1;
            }
        }
    }

    info!(
        dir = %dir.display(),
        scope = ?target.scope,
        deleted = report.deleted_count(),
        failed = report.failed,
        "Log cleanup finished"
    );
    Ok(report)
}
