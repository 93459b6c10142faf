//! Core job types and state transitions.
//!
//! Every transition is expressed here once, as a method on [`Job`], and
//! re-validates the current status before mutating anything. The in-memory
//! store calls these directly; the Postgres store mirrors the same guards in
//! its `WHERE` clauses.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use collectq_core::{DomainError, DomainResult, JobId, WorkerId};

/// Default retry bound for jobs enqueued without an explicit one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Job type, used to route a job to its handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobType {
    /// CSV batch ingestion.
    IngestCsv,
    /// Enforcement computation over ingested judgments.
    Enforce,
    /// Third-party enrichment of debtor records.
    Enrich,
    /// Anything else a producer invents.
    Custom(String),
}

impl JobType {
    pub fn custom(kind: impl Into<String>) -> Self {
        Self::from(kind.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            JobType::IngestCsv => "ingest_csv",
            JobType::Enforce => "enforce",
            JobType::Enrich => "enrich",
            JobType::Custom(kind) => kind,
        }
    }
}

impl From<String> for JobType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "ingest_csv" => JobType::IngestCsv,
            "enforce" => JobType::Enforce,
            "enrich" => JobType::Enrich,
            _ => JobType::Custom(value),
        }
    }
}

impl From<&str> for JobType {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<JobType> for String {
    fn from(value: JobType) -> Self {
        match value {
            JobType::Custom(kind) => kind,
            other => other.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job lifecycle status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be claimed
    Pending,
    /// Claimed by exactly one worker
    Processing,
    /// Finished successfully
    Completed,
    /// Exhausted retries or failed without retry
    Failed,
    /// Held back by an operator
    Paused,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Paused,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Paused => "paused",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job status '{s}'")))
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a guarded state transition.
///
/// `Unchanged` is not an error: it means the row was no longer in the state
/// the caller expected (already resolved, reset by the reaper, edited by an
/// operator), and nothing was written.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The row moved to the given status.
    Applied(JobStatus),
    /// The row was left alone; it is currently in the given status.
    Unchanged(JobStatus),
}

impl Transition {
    pub fn applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }

    pub fn status(&self) -> JobStatus {
        match self {
            Transition::Applied(s) | Transition::Unchanged(s) => *s,
        }
    }
}

/// A job as handed to producers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub max_attempts: Option<u32>,
}

impl NewJob {
    pub fn new(job_type: impl Into<JobType>, payload: serde_json::Value) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            max_attempts: None,
        }
    }

    /// Override the retry bound for this job.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Materialize the row a store persists.
    pub fn into_job(self, default_max_attempts: u32, now: DateTime<Utc>) -> Job {
        Job {
            id: JobId::new(),
            job_type: self.job_type,
            payload: self.payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: self.max_attempts.unwrap_or(default_max_attempts),
            locked_at: None,
            locked_by: None,
            last_error: None,
            result: None,
            recoveries: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A row of the job table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    /// Opaque to the queue; validated only by the handler.
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// Failed attempts that were sent back for retry.
    pub attempts: u32,
    pub max_attempts: u32,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<WorkerId>,
    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,
    /// Times the reaper returned this job to pending.
    pub recoveries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// `pending → processing`, owned by `worker_id`.
    pub fn claim(&mut self, worker_id: &WorkerId, now: DateTime<Utc>) -> Transition {
        if self.status != JobStatus::Pending {
            return Transition::Unchanged(self.status);
        }
        self.status = JobStatus::Processing;
        self.locked_at = Some(now);
        self.locked_by = Some(worker_id.clone());
        self.updated_at = now;
        Transition::Applied(JobStatus::Processing)
    }

    /// `processing → completed`. Any other starting state is a no-op.
    pub fn complete(&mut self, result: serde_json::Value, now: DateTime<Utc>) -> Transition {
        if self.status != JobStatus::Processing {
            return Transition::Unchanged(self.status);
        }
        self.status = JobStatus::Completed;
        self.result = Some(result);
        self.clear_lock();
        self.updated_at = now;
        Transition::Applied(JobStatus::Completed)
    }

    /// `processing → pending` (retry) or `processing → failed` (terminal).
    pub fn fail(&mut self, error: &str, retry_allowed: bool, now: DateTime<Utc>) -> Transition {
        if self.status != JobStatus::Processing {
            return Transition::Unchanged(self.status);
        }
        self.last_error = Some(error.to_string());
        self.clear_lock();
        self.updated_at = now;

        if retry_allowed && self.attempts < self.max_attempts {
            self.attempts += 1;
            self.status = JobStatus::Pending;
        } else {
            self.status = JobStatus::Failed;
        }
        Transition::Applied(self.status)
    }

    /// Whether the reaper should consider this row abandoned.
    pub fn is_stuck(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == JobStatus::Processing && self.locked_at.is_some_and(|at| at < cutoff)
    }

    /// Return an abandoned row to `pending`. Re-checks [`Job::is_stuck`].
    pub fn release_stuck(&mut self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Transition {
        if !self.is_stuck(cutoff) {
            return Transition::Unchanged(self.status);
        }
        self.status = JobStatus::Pending;
        self.clear_lock();
        self.recoveries += 1;
        self.updated_at = now;
        Transition::Applied(JobStatus::Pending)
    }

    /// Operator hold: `pending → paused`.
    pub fn pause(&mut self, now: DateTime<Utc>) -> Transition {
        if self.status != JobStatus::Pending {
            return Transition::Unchanged(self.status);
        }
        self.status = JobStatus::Paused;
        self.updated_at = now;
        Transition::Applied(JobStatus::Paused)
    }

    /// Operator release: `paused → pending`.
    pub fn resume(&mut self, now: DateTime<Utc>) -> Transition {
        if self.status != JobStatus::Paused {
            return Transition::Unchanged(self.status);
        }
        self.status = JobStatus::Pending;
        self.updated_at = now;
        Transition::Applied(JobStatus::Pending)
    }

    /// Check the lock-field invariants for the current status.
    pub fn check_invariants(&self) -> DomainResult<()> {
        let locked = self.locked_at.is_some() || self.locked_by.is_some();
        match self.status {
            JobStatus::Processing if self.locked_at.is_none() || self.locked_by.is_none() => Err(
                DomainError::invalid_transition(format!("job {} processing without a lock", self.id)),
            ),
            JobStatus::Processing => Ok(()),
            _ if locked => Err(DomainError::invalid_transition(format!(
                "job {} is {} but still locked",
                self.id, self.status
            ))),
            _ => Ok(()),
        }
    }

    fn clear_lock(&mut self) {
        self.locked_at = None;
        self.locked_by = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker() -> WorkerId {
        "worker-a".parse().unwrap()
    }

    fn job(max_attempts: u32) -> Job {
        NewJob::new(JobType::IngestCsv, serde_json::json!({"batch_id": "b1"}))
            .with_max_attempts(max_attempts)
            .into_job(DEFAULT_MAX_ATTEMPTS, Utc::now())
    }

    #[test]
    fn job_type_names_round_trip() {
        for name in ["ingest_csv", "enforce", "enrich", "skip_trace"] {
            assert_eq!(JobType::from(name).as_str(), name);
        }
        assert_eq!(JobType::from("enrich"), JobType::Enrich);
        assert_eq!(
            serde_json::to_value(JobType::IngestCsv).unwrap(),
            serde_json::json!("ingest_csv")
        );
    }

    #[test]
    fn status_parsing() {
        assert_eq!("paused".parse::<JobStatus>().unwrap(), JobStatus::Paused);
        assert!("running".parse::<JobStatus>().is_err());
    }

    #[test]
    fn new_job_defaults() {
        let j = NewJob::new("enforce", serde_json::json!({})).into_job(7, Utc::now());
        assert_eq!(j.status, JobStatus::Pending);
        assert_eq!(j.max_attempts, 7);
        assert_eq!(j.attempts, 0);
        j.check_invariants().unwrap();
    }

    #[test]
    fn claim_then_complete() {
        let mut j = job(3);
        assert!(j.claim(&worker(), Utc::now()).applied());
        assert_eq!(j.locked_by, Some(worker()));
        j.check_invariants().unwrap();

        let t = j.complete(serde_json::json!({"rows": 10}), Utc::now());
        assert_eq!(t, Transition::Applied(JobStatus::Completed));
        assert!(j.locked_at.is_none());
        j.check_invariants().unwrap();

        let again = j.complete(serde_json::json!(null), Utc::now());
        assert_eq!(again, Transition::Unchanged(JobStatus::Completed));
        assert_eq!(j.result, Some(serde_json::json!({"rows": 10})));
    }

    #[test]
    fn claim_requires_pending() {
        let mut j = job(3);
        j.claim(&worker(), Utc::now());
        let other: WorkerId = "worker-b".parse().unwrap();
        assert_eq!(
            j.claim(&other, Utc::now()),
            Transition::Unchanged(JobStatus::Processing)
        );
        assert_eq!(j.locked_by, Some(worker()));
    }

    #[test]
    fn fail_retries_until_bound() {
        let mut j = job(2);
        for expected_attempts in 1..=2 {
            j.claim(&worker(), Utc::now());
            let t = j.fail("boom", true, Utc::now());
            assert_eq!(t, Transition::Applied(JobStatus::Pending));
            assert_eq!(j.attempts, expected_attempts);
            j.check_invariants().unwrap();
        }

        j.claim(&worker(), Utc::now());
        let t = j.fail("boom", true, Utc::now());
        assert_eq!(t, Transition::Applied(JobStatus::Failed));
        assert_eq!(j.last_error.as_deref(), Some("boom"));
        j.check_invariants().unwrap();
    }

    #[test]
    fn non_retryable_failure_is_terminal() {
        let mut j = job(5);
        j.claim(&worker(), Utc::now());
        assert_eq!(
            j.fail("bad csv header", false, Utc::now()),
            Transition::Applied(JobStatus::Failed)
        );
        assert_eq!(j.attempts, 0);
    }

    #[test]
    fn release_stuck_rechecks_state() {
        let mut j = job(3);
        let claimed_at = Utc::now() - chrono::Duration::minutes(30);
        j.claim(&worker(), claimed_at);

        let cutoff = Utc::now() - chrono::Duration::minutes(10);
        assert!(j.is_stuck(cutoff));
        assert!(j.release_stuck(cutoff, Utc::now()).applied());
        assert_eq!(j.recoveries, 1);
        j.check_invariants().unwrap();

        // Already pending: a second reaper pass changes nothing.
        assert_eq!(
            j.release_stuck(cutoff, Utc::now()),
            Transition::Unchanged(JobStatus::Pending)
        );
        assert_eq!(j.recoveries, 1);
    }

    #[test]
    fn pause_and_resume() {
        let mut j = job(3);
        assert!(j.pause(Utc::now()).applied());
        assert_eq!(
            j.claim(&worker(), Utc::now()),
            Transition::Unchanged(JobStatus::Paused)
        );
        assert!(j.resume(Utc::now()).applied());
        assert!(j.claim(&worker(), Utc::now()).applied());
        assert_eq!(j.pause(Utc::now()), Transition::Unchanged(JobStatus::Processing));
    }
}
