//! Run status classification
//!
//! The analysis program has no structured completion signal, only free-text
//! log lines. Status is derived by substring matching against configured
//! markers; marker text changing upstream silently breaks detection.

use serde::{Deserialize, Serialize};

/// Coarse status of one analysis run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Processing,
    Completed,
    Error,
    NotFound,
}

/// Marker substrings emitted by the analysis program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusMarkers {
    /// Any of these in a line means the run finished
    pub completed: Vec<String>,
    /// Any of these in a line means the run failed
    pub error: Vec<String>,
}

impl Default for StatusMarkers {
    fn default() -> Self {
        Self {
            completed: vec![
                "처리가 완료되었습니다.".to_string(),
                "Detections saved at".to_string(),
            ],
            error: vec!["오류가 발생했습니다.".to_string()],
        }
    }
}

impl StatusMarkers {
    pub fn is_completion(&self, line: &str) -> bool {
        self.completed.iter().any(|m| !m.is_empty() && line.contains(m.as_str()))
    }

    pub fn is_error(&self, line: &str) -> bool {
        self.error.iter().any(|m| !m.is_empty() && line.contains(m.as_str()))
    }

    /// True if any buffered line carries a completion marker
    pub fn any_completion<'a>(&self, lines: impl IntoIterator<Item = &'a str>) -> bool {
        lines.into_iter().any(|l| self.is_completion(l))
    }

    pub fn any_error<'a>(&self, lines: impl IntoIterator<Item = &'a str>) -> bool {
        lines.into_iter().any(|l| self.is_error(l))
    }
}

/// Classify the most recent log line
///
/// Completion wins over error when a line carries both markers.
pub fn classify_line(last_line: &str, markers: &StatusMarkers) -> JobStatus {
    if markers.is_completion(last_line) {
        JobStatus::Completed
    } else if markers.is_error(last_line) {
        JobStatus::Error
    } else {
        JobStatus::Processing
    }
}
