//! Rotated log file discovery
//!
//! The analysis program writes `instance_seg.log_YYYY-MM-DD-HH-mm-ss` files
//! into its log directory, stamped with local time. Newest is decided by the
//! embedded timestamp, not by filesystem metadata.

use chrono::NaiveDateTime;
use std::cmp::Ordering;
use std::io;
use std::path::{Path, PathBuf};

/// Naming pattern of rotated log files
#[derive(Debug, Clone, PartialEq)]
pub struct LogFileNaming {
    pub prefix: String,
    pub timestamp_format: String,
}

impl Default for LogFileNaming {
    fn default() -> Self {
        Self {
            prefix: "instance_seg.log_".to_string(),
            timestamp_format: "%Y-%m-%d-%H-%M-%S".to_string(),
        }
    }
}

impl LogFileNaming {
    pub fn matches(&self, file_name: &str) -> bool {
        file_name.starts_with(&self.prefix)
    }

    /// Timestamp embedded after the prefix; trailing text is ignored
    pub fn parse_timestamp(&self, file_name: &str) -> Option<NaiveDateTime> {
        let rest = file_name.strip_prefix(&self.prefix)?;
        NaiveDateTime::parse_and_remainder(rest, &self.timestamp_format)
            .ok()
            .map(|(stamp, _)| stamp)
    }

    /// File name a run started at `stamp` would write
    pub fn file_name_for(&self, stamp: NaiveDateTime) -> String {
        format!("{}{}", self.prefix, stamp.format(&self.timestamp_format))
    }
}

/// One rotated log file
#[derive(Debug, Clone, PartialEq)]
pub struct LogFileEntry {
    pub path: PathBuf,
    pub stamp: Option<NaiveDateTime>,
    pub size: u64,
}

/// Newest stamp first; unstamped files sort last
fn newest_first(a: &LogFileEntry, b: &LogFileEntry) -> Ordering {
    match (a.stamp, b.stamp) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => b.path.cmp(&a.path),
    }
}

/// All rotated log files in `dir`, newest first
///
/// A missing directory is created and yields an empty list.
pub async fn list_log_files(dir: &Path, naming: &LogFileNaming) -> io::Result<Vec<LogFileEntry>> {
    if !tokio::fs::try_exists(dir).await? {
        tokio::fs::create_dir_all(dir).await?;
        tracing::info!(dir = %dir.display(), "Created log directory");
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    let mut read_dir = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if !naming.matches(name) {
            continue;
        }
        let metadata = match entry.metadata().await {
            Ok(m) if m.is_file() => m,
            _ => continue,
        };
        entries.push(LogFileEntry {
            path: entry.path(),
            stamp: naming.parse_timestamp(name),
            size: metadata.len(),
        });
    }

    entries.sort_by(newest_first);
    Ok(entries)
}

/// Newest log file, optionally ignoring files stamped before `not_before`
///
/// Only the newest candidate is considered: if it is still empty the caller
/// should wait rather than fall back to an older run's log.
pub async fn find_latest_log_file(
    dir: &Path,
    naming: &LogFileNaming,
    not_before: Option<NaiveDateTime>,
) -> io::Result<Option<LogFileEntry>> {
    let entries = list_log_files(dir, naming).await?;
    Ok(entries.into_iter().find(|entry| match (not_before, entry.stamp) {
        (Some(bound), Some(stamp)) => stamp >= bound,
        (Some(_), None) => false,
        (None, _) => true,
    }))
}
