//! Bounded in-memory log history
//!
//! Keeps the most recent lines of a growing log, evicting the oldest first.
//! Every pushed line gets a sequence number so readers can ask for "what is
//! new since I last looked" even after eviction.

use chrono::{SecondsFormat, Utc};
use std::collections::VecDeque;
use std::fmt;

/// Line cap for a followed analysis log
pub const TAIL_CAPACITY: usize = 1000;

/// Line cap for per-session system messages
pub const SYSTEM_LOG_CAPACITY: usize = 100;

/// Severity tag used in system log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        };
        f.write_str(tag)
    }
}

/// Format a relay-generated line: `[2024-05-01T10:00:00.000Z] [INFO] message`
pub fn system_line(level: LogLevel, message: impl AsRef<str>) -> String {
    format!(
        "[{}] [{}] {}",
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        level,
        message.as_ref()
    )
}

/// Capped, ordered log history
#[derive(Debug, Clone)]
pub struct LogBuffer {
    lines: VecDeque<String>,
    capacity: usize,
    total_pushed: u64,
}

impl LogBuffer {
    /// Create an empty buffer holding at most `capacity` lines (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            total_pushed: 0,
        }
    }

    /// Empty buffer whose first line gets sequence number `next_seq`
    ///
    /// Replaces a previous buffer without handing out sequence numbers its
    /// readers have already consumed.
    pub fn continuing(capacity: usize, next_seq: u64) -> Self {
        let mut buffer = Self::new(capacity);
        buffer.total_pushed = next_seq;
        buffer
    }

    pub fn push(&mut self, line: impl Into<String>) {
        self.lines.push_back(line.into());
        self.total_pushed += 1;
        while self.lines.len() > self.capacity {
            self.lines.pop_front();
        }
    }

    /// Append every non-empty line of a text chunk
    pub fn push_text(&mut self, text: &str) {
        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            if !line.is_empty() {
                self.push(line);
            }
        }
    }

    /// Append a relay-generated line
    pub fn push_system(&mut self, level: LogLevel, message: impl AsRef<str>) {
        self.push(system_line(level, message));
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    pub fn last(&self) -> Option<&str> {
        self.lines.back().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sequence number the next pushed line will receive
    pub fn next_seq(&self) -> u64 {
        self.total_pushed
    }

    /// Lines with sequence number >= `seq` that are still buffered,
    /// plus the cursor to pass on the next call
    pub fn since(&self, seq: u64) -> (Vec<String>, u64) {
        let first_buffered = self.total_pushed - self.lines.len() as u64;
        let skip = seq.saturating_sub(first_buffered) as usize;
        let lines = self.lines.iter().skip(skip).cloned().collect();
        (lines, self.total_pushed)
    }
}
