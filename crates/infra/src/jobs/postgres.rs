//! Postgres-backed job store.
//!
//! ## Claiming
//!
//! `claim_next` runs one short transaction:
//!
//! 1. `SELECT … FOR UPDATE SKIP LOCKED` picks the oldest pending row of the
//!    type that no other transaction holds
//! 2. a conditional `UPDATE … WHERE status = 'pending'` moves it to
//!    `processing` and stamps the lock
//!
//! Racing workers skip each other's locked rows instead of queueing behind
//! them, and the status guard in step 2 keeps a hand-edited row from being
//! claimed twice.
//!
//! ## Error Mapping
//!
//! | sqlx error | Classification | JobStoreError |
//! |------------|----------------|---------------|
//! | Io / PoolTimedOut / PoolClosed / SQLSTATE 08xxx, 57P0x | transient | `Unavailable` |
//! | SQLSTATE 28P01 / 28000, auth signatures | auth failure | `Unavailable` |
//! | anything else | config / unknown | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use collectq_core::{JobId, WorkerId};

use super::store::{JobCounts, JobStore, JobStoreError};
use super::types::{DEFAULT_MAX_ATTEMPTS, Job, JobStatus, JobType, NewJob, Transition};
use crate::db::{SqlFault, map_sqlx_error};

/// Postgres-backed job queue.
///
/// Constructed from a pool obtained through the connection guard.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    default_max_attempts: u32,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, default_max_attempts: u32) -> Self {
        self.default_max_attempts = default_max_attempts;
        self
    }

    /// Current status of a row, or `NotFound`.
    async fn current_status(&self, job_id: JobId) -> Result<JobStatus, JobStoreError> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM jobs WHERE id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| store_error("current_status", e))?;

        match status {
            Some(s) => parse_status(&s),
            None => Err(JobStoreError::NotFound(job_id)),
        }
    }

    /// Interpret the `RETURNING status` of a guarded update.
    async fn resolve(
        &self,
        job_id: JobId,
        returned: Option<String>,
    ) -> Result<Transition, JobStoreError> {
        match returned {
            Some(s) => Ok(Transition::Applied(parse_status(&s)?)),
            None => Ok(Transition::Unchanged(self.current_status(job_id).await?)),
        }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_type = %job.job_type), err)]
    async fn enqueue(&self, job: NewJob) -> Result<JobId, JobStoreError> {
        let job = job.into_job(self.default_max_attempts, Utc::now());

        sqlx::query(
            r#"
            INSERT INTO jobs (id, job_type, payload, status, attempts, max_attempts, created_at, updated_at)
            VALUES ($1, $2, $3, 'pending', 0, $4, $5, $5)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.job_type.as_str())
        .bind(&job.payload)
        .bind(job.max_attempts as i32)
        .bind(job.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| store_error("enqueue", e))?;

        Ok(job.id)
    }

    #[instrument(skip(self), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| store_error("get", e))?;

        row.map(|r| decode_job(&r)).transpose()
    }

    #[instrument(skip(self), fields(job_type = %job_type, worker_id = %worker_id), err)]
    async fn claim_next(
        &self,
        job_type: &JobType,
        worker_id: &WorkerId,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| store_error("begin_transaction", e))?;

        let candidate: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id
            FROM jobs
            WHERE status = 'pending' AND job_type = $1
            ORDER BY created_at ASC, id ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(job_type.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| store_error("claim_next.select", e))?;

        let Some(id) = candidate else {
            tx.rollback()
                .await
                .map_err(|e| store_error("rollback", e))?;
            return Ok(None);
        };

        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'processing',
                locked_at = now(),
                locked_by = $2,
                updated_at = now()
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(worker_id.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| store_error("claim_next.update", e))?;

        tx.commit()
            .await
            .map_err(|e| store_error("commit", e))?;

        row.map(|r| decode_job(&r)).transpose()
    }

    #[instrument(skip(self, result), err)]
    async fn complete(
        &self,
        job_id: JobId,
        result: serde_json::Value,
    ) -> Result<Transition, JobStoreError> {
        let returned: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE jobs
            SET status = 'completed',
                result = $2,
                locked_at = NULL,
                locked_by = NULL,
                updated_at = now()
            WHERE id = $1 AND status = 'processing'
            RETURNING status
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(&result)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| store_error("complete", e))?;

        self.resolve(job_id, returned).await
    }

    #[instrument(skip(self, error), err)]
    async fn fail(
        &self,
        job_id: JobId,
        error: &str,
        retry_allowed: bool,
    ) -> Result<Transition, JobStoreError> {
        // SET expressions all see the pre-update row, so both CASEs agree.
        let returned: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE jobs
            SET status = CASE WHEN $3 AND attempts < max_attempts THEN 'pending' ELSE 'failed' END,
                attempts = CASE WHEN $3 AND attempts < max_attempts THEN attempts + 1 ELSE attempts END,
                last_error = $2,
                locked_at = NULL,
                locked_by = NULL,
                updated_at = now()
            WHERE id = $1 AND status = 'processing'
            RETURNING status
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(error)
        .bind(retry_allowed)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| store_error("fail", e))?;

        self.resolve(job_id, returned).await
    }

    #[instrument(skip(self), err)]
    async fn pause(&self, job_id: JobId) -> Result<Transition, JobStoreError> {
        let returned: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE jobs SET status = 'paused', updated_at = now()
            WHERE id = $1 AND status = 'pending'
            RETURNING status
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| store_error("pause", e))?;

        self.resolve(job_id, returned).await
    }

    #[instrument(skip(self), err)]
    async fn resume(&self, job_id: JobId) -> Result<Transition, JobStoreError> {
        let returned: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE jobs SET status = 'pending', updated_at = now()
            WHERE id = $1 AND status = 'paused'
            RETURNING status
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| store_error("resume", e))?;

        self.resolve(job_id, returned).await
    }

    #[instrument(skip(self), err)]
    async fn find_stuck(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobId>, JobStoreError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id
            FROM jobs
            WHERE status = 'processing' AND locked_at < $1
            ORDER BY locked_at ASC, id ASC
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| store_error("find_stuck", e))?;

        Ok(ids.into_iter().map(JobId::from_uuid).collect())
    }

    #[instrument(skip(self), err)]
    async fn release_stuck(
        &self,
        job_id: JobId,
        cutoff: DateTime<Utc>,
    ) -> Result<Transition, JobStoreError> {
        // Re-validated here, not trusted from find_stuck: the worker may have
        // resolved the job in between.
        let returned: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE jobs
            SET status = 'pending',
                locked_at = NULL,
                locked_by = NULL,
                recoveries = recoveries + 1,
                updated_at = now()
            WHERE id = $1 AND status = 'processing' AND locked_at < $2
            RETURNING status
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(cutoff)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| store_error("release_stuck", e))?;

        self.resolve(job_id, returned).await
    }

    #[instrument(skip(self), err)]
    async fn counts_by_status(&self) -> Result<JobCounts, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| store_error("counts_by_status", e))?;

        let mut counts = JobCounts::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| store_error("counts_by_status.decode", e))?;
            let n: i64 = row
                .try_get("n")
                .map_err(|e| store_error("counts_by_status.decode", e))?;
            counts.add(parse_status(&status)?, n.max(0) as u64);
        }
        Ok(counts)
    }

    #[instrument(skip(self), err)]
    async fn count_stuck(&self, cutoff: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE status = 'processing' AND locked_at < $1",
        )
        .bind(cutoff)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| store_error("count_stuck", e))?;

        Ok(n.max(0) as u64)
    }
}

fn store_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match map_sqlx_error(operation, err) {
        SqlFault::Unavailable { class, message } => JobStoreError::Unavailable { class, message },
        SqlFault::Storage(message) => JobStoreError::Storage(message),
    }
}

fn parse_status(raw: &str) -> Result<JobStatus, JobStoreError> {
    raw.parse()
        .map_err(|e| JobStoreError::Storage(format!("{e}")))
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: Uuid,
    job_type: String,
    payload: serde_json::Value,
    status: String,
    attempts: i32,
    max_attempts: i32,
    locked_at: Option<DateTime<Utc>>,
    locked_by: Option<String>,
    last_error: Option<String>,
    result: Option<serde_json::Value>,
    recoveries: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            job_type: row.try_get("job_type")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            locked_at: row.try_get("locked_at")?,
            locked_by: row.try_get("locked_by")?,
            last_error: row.try_get("last_error")?,
            result: row.try_get("result")?,
            recoveries: row.try_get("recoveries")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let locked_by = row
            .locked_by
            .map(|w| w.parse::<WorkerId>())
            .transpose()
            .map_err(|e| JobStoreError::Storage(format!("job {}: {e}", row.id)))?;

        Ok(Job {
            id: JobId::from_uuid(row.id),
            job_type: JobType::from(row.job_type),
            payload: row.payload,
            status: parse_status(&row.status)?,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            locked_at: row.locked_at,
            locked_by,
            last_error: row.last_error,
            result: row.result,
            recoveries: row.recoveries.max(0) as u32,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn decode_job(row: &sqlx::postgres::PgRow) -> Result<Job, JobStoreError> {
    use sqlx::FromRow;
    let row = JobRow::from_row(row).map_err(|e| store_error("decode_job", e))?;
    Job::try_from(row)
}
