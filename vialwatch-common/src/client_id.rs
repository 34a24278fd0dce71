//! Client identifiers
//!
//! A client id correlates one upload, its log tail, and every follow-up
//! request. Ids are decimal milliseconds since the Unix epoch, so the session
//! start time can be recovered from the id alone.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::Error;

/// Opaque correlation token for one analysis run
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub struct ClientId(String);

impl ClientId {
    /// Id built from an explicit millisecond timestamp
    pub fn from_millis(millis: i64) -> Self {
        Self(millis.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Session start encoded in the id, if the id is time-based
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        let millis: i64 = self.0.parse().ok()?;
        Utc.timestamp_millis_opt(millis).single()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ClientId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidInput("client id must not be empty".to_string()));
        }
        if trimmed.contains(['/', '\\']) {
            return Err(Error::InvalidInput(format!("invalid client id: {}", trimmed)));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl TryFrom<String> for ClientId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Issues strictly increasing time-based client ids
///
/// Two calls inside the same millisecond still get distinct ids: the second
/// one is bumped past the last issued value.
#[derive(Debug, Default)]
pub struct ClientIdGenerator {
    last: AtomicI64,
}

impl ClientIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> ClientId {
        let now = Utc::now().timestamp_millis();
        let previous = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        ClientId::from_millis(now.max(previous + 1))
    }
}
