//! Job storage abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use collectq_core::{JobId, WorkerId};

use super::types::{DEFAULT_MAX_ATTEMPTS, Job, JobStatus, JobType, NewJob, Transition};
use crate::connection::{ConnectFailure, FailureClass};

/// Job store abstraction.
///
/// Every mutating operation re-validates the row's status at write time, so a
/// snapshot read earlier (by a worker, the reaper, or an operator) can never
/// push a row through an illegal transition.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new `pending` job.
    async fn enqueue(&self, job: NewJob) -> Result<JobId, JobStoreError>;

    /// Get a job by ID.
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Claim the oldest pending job of `job_type` for `worker_id`.
    ///
    /// At most one concurrent caller receives any given row; losers of a race
    /// get `None`.
    async fn claim_next(
        &self,
        job_type: &JobType,
        worker_id: &WorkerId,
    ) -> Result<Option<Job>, JobStoreError>;

    /// `processing → completed`. Idempotent.
    async fn complete(
        &self,
        job_id: JobId,
        result: serde_json::Value,
    ) -> Result<Transition, JobStoreError>;

    /// `processing → pending` when retry is allowed and attempts remain,
    /// otherwise `processing → failed`.
    async fn fail(
        &self,
        job_id: JobId,
        error: &str,
        retry_allowed: bool,
    ) -> Result<Transition, JobStoreError>;

    /// Operator hold: `pending → paused`.
    async fn pause(&self, job_id: JobId) -> Result<Transition, JobStoreError>;

    /// Operator release: `paused → pending`.
    async fn resume(&self, job_id: JobId) -> Result<Transition, JobStoreError>;

    /// IDs of `processing` rows locked before `cutoff`, oldest lock first.
    async fn find_stuck(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobId>, JobStoreError>;

    /// Return one abandoned row to `pending`, re-checking that it is still
    /// `processing` with `locked_at < cutoff`.
    async fn release_stuck(
        &self,
        job_id: JobId,
        cutoff: DateTime<Utc>,
    ) -> Result<Transition, JobStoreError>;

    /// Job counts per status.
    async fn counts_by_status(&self) -> Result<JobCounts, JobStoreError>;

    /// Number of `processing` rows locked before `cutoff`.
    async fn count_stuck(&self, cutoff: DateTime<Utc>) -> Result<u64, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    /// The store could not be reached; retry per the class's policy.
    #[error("store unavailable ({class}): {message}")]
    Unavailable { class: FailureClass, message: String },
    #[error("storage error: {0}")]
    Storage(String),
}

impl JobStoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobStoreError::Unavailable { .. })
    }

    /// Classification of a connectivity failure, if this is one.
    pub fn failure_class(&self) -> Option<FailureClass> {
        match self {
            JobStoreError::Unavailable { class, .. } => Some(*class),
            _ => None,
        }
    }
}

impl From<ConnectFailure> for JobStoreError {
    fn from(failure: ConnectFailure) -> Self {
        JobStoreError::Unavailable {
            class: failure.class,
            message: failure.message,
        }
    }
}

/// Job counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub paused: u64,
}

impl JobCounts {
    pub fn add(&mut self, status: JobStatus, n: u64) {
        match status {
            JobStatus::Pending => self.pending += n,
            JobStatus::Processing => self.processing += n,
            JobStatus::Completed => self.completed += n,
            JobStatus::Failed => self.failed += n,
            JobStatus::Paused => self.paused += n,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed + self.paused
    }
}

/// In-memory job store for tests/dev.
///
/// A single mutex stands in for the row lock: `claim_next` selects and
/// transitions under it, so two claimers can never observe the same pending
/// row.
#[derive(Debug)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<JobId, Job>>,
    default_max_attempts: u32,
    outage: Mutex<Option<ConnectFailure>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_max_attempts(DEFAULT_MAX_ATTEMPTS)
    }

    pub fn with_max_attempts(default_max_attempts: u32) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            default_max_attempts,
            outage: Mutex::new(None),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make every operation fail with `failure` until cleared with `None`.
    pub fn simulate_outage(&self, failure: Option<ConnectFailure>) {
        *self.outage.lock().unwrap() = failure;
    }

    /// Overwrite a row as an operator would during an incident.
    pub fn force_update(&self, job: Job) {
        self.jobs.lock().unwrap().insert(job.id, job);
    }

    fn check_available(&self) -> Result<(), JobStoreError> {
        match self.outage.lock().unwrap().as_ref() {
            Some(failure) => Err(failure.clone().into()),
            None => Ok(()),
        }
    }

    fn transition<F>(&self, job_id: JobId, f: F) -> Result<Transition, JobStoreError>
    where
        F: FnOnce(&mut Job, DateTime<Utc>) -> Transition,
    {
        self.check_available()?;
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        Ok(f(job, Utc::now()))
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: NewJob) -> Result<JobId, JobStoreError> {
        self.check_available()?;
        let job = job.into_job(self.default_max_attempts, Utc::now());
        let id = job.id;
        self.jobs.lock().unwrap().insert(id, job);
        Ok(id)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.check_available()?;
        Ok(self.jobs.lock().unwrap().get(&job_id).cloned())
    }

    async fn claim_next(
        &self,
        job_type: &JobType,
        worker_id: &WorkerId,
    ) -> Result<Option<Job>, JobStoreError> {
        self.check_available()?;
        let mut jobs = self.jobs.lock().unwrap();

        // Oldest pending job of this type (FIFO by created_at, id breaks ties).
        let candidate = jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending && &j.job_type == job_type)
            .min_by_key(|j| (j.created_at, j.id))
            .map(|j| j.id);

        let Some(job_id) = candidate else {
            return Ok(None);
        };
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        if job.claim(worker_id, Utc::now()).applied() {
            Ok(Some(job.clone()))
        } else {
            Ok(None)
        }
    }

    async fn complete(
        &self,
        job_id: JobId,
        result: serde_json::Value,
    ) -> Result<Transition, JobStoreError> {
        self.transition(job_id, |job, now| job.complete(result, now))
    }

    async fn fail(
        &self,
        job_id: JobId,
        error: &str,
        retry_allowed: bool,
    ) -> Result<Transition, JobStoreError> {
        self.transition(job_id, |job, now| job.fail(error, retry_allowed, now))
    }

    async fn pause(&self, job_id: JobId) -> Result<Transition, JobStoreError> {
        self.transition(job_id, |job, now| job.pause(now))
    }

    async fn resume(&self, job_id: JobId) -> Result<Transition, JobStoreError> {
        self.transition(job_id, |job, now| job.resume(now))
    }

    async fn find_stuck(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobId>, JobStoreError> {
        self.check_available()?;
        let jobs = self.jobs.lock().unwrap();
        let mut stuck: Vec<_> = jobs.values().filter(|j| j.is_stuck(cutoff)).collect();
        stuck.sort_by_key(|j| (j.locked_at, j.id));
        Ok(stuck.into_iter().take(limit).map(|j| j.id).collect())
    }

    async fn release_stuck(
        &self,
        job_id: JobId,
        cutoff: DateTime<Utc>,
    ) -> Result<Transition, JobStoreError> {
        self.transition(job_id, |job, now| job.release_stuck(cutoff, now))
    }

    async fn counts_by_status(&self) -> Result<JobCounts, JobStoreError> {
        self.check_available()?;
        let jobs = self.jobs.lock().unwrap();
        let mut counts = JobCounts::default();
        for job in jobs.values() {
            counts.add(job.status, 1);
        }
        Ok(counts)
    }

    async fn count_stuck(&self, cutoff: DateTime<Utc>) -> Result<u64, JobStoreError> {
        self.check_available()?;
        let jobs = self.jobs.lock().unwrap();
        Ok(jobs.values().filter(|j| j.is_stuck(cutoff)).count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(name: &str) -> WorkerId {
        name.parse().unwrap()
    }

    #[tokio::test]
    async fn enqueue_and_claim() {
        let store = InMemoryJobStore::new();
        let job_id = store
            .enqueue(NewJob::new(JobType::IngestCsv, serde_json::json!({"batch_id": "b1"})))
            .await
            .unwrap();

        let claimed = store
            .claim_next(&JobType::IngestCsv, &worker("w1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, job_id);
        assert_eq!(claimed.status, JobStatus::Processing);
        assert_eq!(claimed.locked_by, Some(worker("w1")));
        assert!(claimed.locked_at.is_some());

        // No more jobs
        assert!(
            store
                .claim_next(&JobType::IngestCsv, &worker("w2"))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn claim_is_scoped_to_job_type_and_fifo() {
        let store = InMemoryJobStore::new();
        let first = store
            .enqueue(NewJob::new(JobType::Enrich, serde_json::json!({"n": 1})))
            .await
            .unwrap();
        store
            .enqueue(NewJob::new(JobType::Enforce, serde_json::json!({})))
            .await
            .unwrap();
        let second = store
            .enqueue(NewJob::new(JobType::Enrich, serde_json::json!({"n": 2})))
            .await
            .unwrap();

        let w = worker("w1");
        let a = store.claim_next(&JobType::Enrich, &w).await.unwrap().unwrap();
        let b = store.claim_next(&JobType::Enrich, &w).await.unwrap().unwrap();
        assert_eq!((a.id, b.id), (first, second));
        assert!(store.claim_next(&JobType::Enrich, &w).await.unwrap().is_none());
        assert!(store.claim_next(&JobType::Enforce, &w).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn concurrent_claimers_get_one_row() {
        let store = Arc::new(InMemoryJobStore::new());
        store
            .enqueue(NewJob::new(JobType::IngestCsv, serde_json::json!({})))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let w: WorkerId = format!("w{i}").parse().unwrap();
                store.claim_next(&JobType::IngestCsv, &w).await.unwrap()
            }));
        }

        let mut winners = 0;
        for h in handles {
            if h.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn complete_is_idempotent() {
        let store = InMemoryJobStore::new();
        let id = store
            .enqueue(NewJob::new(JobType::Enforce, serde_json::json!({})))
            .await
            .unwrap();
        store.claim_next(&JobType::Enforce, &worker("w1")).await.unwrap();

        let first = store.complete(id, serde_json::json!({"ok": true})).await.unwrap();
        let second = store.complete(id, serde_json::json!({"ok": false})).await.unwrap();
        assert_eq!(first, Transition::Applied(JobStatus::Completed));
        assert_eq!(second, Transition::Unchanged(JobStatus::Completed));

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.result, Some(serde_json::json!({"ok": true})));
        job.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn retry_bound_is_respected() {
        let store = InMemoryJobStore::with_max_attempts(3);
        let id = store
            .enqueue(NewJob::new(JobType::Enrich, serde_json::json!({})))
            .await
            .unwrap();
        let w = worker("w1");

        // max_attempts + 1 retryable failures
        let mut last = None;
        for _ in 0..4 {
            store.claim_next(&JobType::Enrich, &w).await.unwrap().unwrap();
            last = Some(store.fail(id, "vendor 503", true).await.unwrap());
        }
        assert_eq!(last, Some(Transition::Applied(JobStatus::Failed)));

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 3);
        assert_eq!(job.last_error.as_deref(), Some("vendor 503"));
        assert!(store.claim_next(&JobType::Enrich, &w).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fail_on_unclaimed_job_is_a_noop() {
        let store = InMemoryJobStore::new();
        let id = store
            .enqueue(NewJob::new(JobType::Enrich, serde_json::json!({})))
            .await
            .unwrap();
        let t = store.fail(id, "late report", false).await.unwrap();
        assert_eq!(t, Transition::Unchanged(JobStatus::Pending));
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let store = InMemoryJobStore::new();
        let missing = JobId::new();
        assert_eq!(
            store.complete(missing, serde_json::json!(null)).await,
            Err(JobStoreError::NotFound(missing))
        );
    }

    #[tokio::test]
    async fn paused_jobs_are_not_claimed() {
        let store = InMemoryJobStore::new();
        let id = store
            .enqueue(NewJob::new(JobType::IngestCsv, serde_json::json!({})))
            .await
            .unwrap();
        assert!(store.pause(id).await.unwrap().applied());
        assert!(
            store
                .claim_next(&JobType::IngestCsv, &worker("w1"))
                .await
                .unwrap()
                .is_none()
        );
        assert!(store.resume(id).await.unwrap().applied());
        assert!(
            store
                .claim_next(&JobType::IngestCsv, &worker("w1"))
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn outage_surfaces_as_retryable_error() {
        let store = InMemoryJobStore::new();
        store.simulate_outage(Some(ConnectFailure::transient("connection reset")));

        let err = store
            .enqueue(NewJob::new(JobType::IngestCsv, serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.failure_class(), Some(FailureClass::TransientNetwork));

        store.simulate_outage(None);
        assert!(
            store
                .enqueue(NewJob::new(JobType::IngestCsv, serde_json::json!({})))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn counts_track_statuses() {
        let store = InMemoryJobStore::new();
        for i in 0..5 {
            store
                .enqueue(NewJob::new(JobType::IngestCsv, serde_json::json!({"i": i})))
                .await
                .unwrap();
        }
        let w = worker("w1");
        store.claim_next(&JobType::IngestCsv, &w).await.unwrap();
        store.claim_next(&JobType::IngestCsv, &w).await.unwrap();

        let counts = store.counts_by_status().await.unwrap();
        assert_eq!(counts.pending, 3);
        assert_eq!(counts.processing, 2);
        assert_eq!(counts.total(), 5);
    }
}
