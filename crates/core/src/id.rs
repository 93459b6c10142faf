//! Strongly-typed identifiers used across the queue.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of a queued job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Create a new identifier.
    ///
    /// Uses UUIDv7 (time-ordered), so ids sort roughly by creation time.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for JobId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for JobId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<JobId> for Uuid {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl FromStr for JobId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid =
            Uuid::from_str(s).map_err(|e| DomainError::invalid_id(format!("JobId: {}", e)))?;
        Ok(Self(uuid))
    }
}

/// Identifier of a worker process.
///
/// Unique per process. Must start with a letter and contain only
/// alphanumerics, `_`, `-`, `.` or `:`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    /// Build an id of the form `<worker_type>-<host>-<pid>-<suffix>`.
    pub fn generate(worker_type: &str, host: &str) -> Self {
        let suffix = Uuid::now_v7().simple().to_string();
        let raw = format!(
            "{}-{}-{}-{}",
            worker_type,
            host,
            std::process::id(),
            &suffix[suffix.len() - 8..]
        );
        let cleaned: String = raw
            .chars()
            .map(|c| if is_allowed(c) { c } else { '-' })
            .collect();
        if cleaned.starts_with(|c: char| c.is_alphabetic()) {
            Self(cleaned)
        } else {
            Self(format!("w{cleaned}"))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_allowed(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':')
}

impl core::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for WorkerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<WorkerId> for String {
    fn from(id: WorkerId) -> Self {
        id.0
    }
}

impl FromStr for WorkerId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.chars().next() {
            None => return Err(DomainError::invalid_id("WorkerId: empty string")),
            Some(c) if !c.is_alphabetic() => {
                return Err(DomainError::invalid_id(format!(
                    "WorkerId '{s}': must start with a letter"
                )));
            }
            Some(_) => {}
        }

        if let Some(c) = s.chars().find(|c| !is_allowed(*c)) {
            return Err(DomainError::invalid_id(format!(
                "WorkerId '{s}': invalid character '{c}'"
            )));
        }

        Ok(Self(s.to_string()))
    }
}
