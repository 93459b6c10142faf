//! Postgres-backed heartbeat registry (`worker_heartbeats` table).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;

use collectq_core::WorkerId;

use super::{HeartbeatError, HeartbeatStore, WorkerHeartbeat, WorkerStatus};
use crate::db::{SqlFault, map_sqlx_error};

#[derive(Debug, Clone)]
pub struct PostgresHeartbeatStore {
    pool: Arc<PgPool>,
}

impl PostgresHeartbeatStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl HeartbeatStore for PostgresHeartbeatStore {
    #[instrument(skip(self), fields(worker_id = %worker_id), err)]
    async fn record_heartbeat(
        &self,
        worker_id: &WorkerId,
        worker_type: &str,
    ) -> Result<(), HeartbeatError> {
        sqlx::query(
            r#"
            INSERT INTO worker_heartbeats (worker_id, worker_type, status, started_at, last_heartbeat_at)
            VALUES ($1, $2, 'running', now(), now())
            ON CONFLICT (worker_id) DO UPDATE
            SET worker_type = EXCLUDED.worker_type,
                status = 'running',
                last_heartbeat_at = EXCLUDED.last_heartbeat_at
            "#,
        )
        .bind(worker_id.as_str())
        .bind(worker_type)
        .execute(&*self.pool)
        .await
        .map_err(|e| heartbeat_error("record_heartbeat", e))?;

        Ok(())
    }

    #[instrument(skip(self), fields(worker_id = %worker_id), err)]
    async fn mark_status(
        &self,
        worker_id: &WorkerId,
        status: WorkerStatus,
    ) -> Result<(), HeartbeatError> {
        let result = sqlx::query("UPDATE worker_heartbeats SET status = $2 WHERE worker_id = $1")
            .bind(worker_id.as_str())
            .bind(status.as_str())
            .execute(&*self.pool)
            .await
            .map_err(|e| heartbeat_error("mark_status", e))?;

        if result.rows_affected() == 0 {
            return Err(HeartbeatError::UnknownWorker(worker_id.clone()));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(worker_id = %worker_id), err)]
    async fn get(&self, worker_id: &WorkerId) -> Result<Option<WorkerHeartbeat>, HeartbeatError> {
        let row = sqlx::query(
            r#"
            SELECT worker_id, worker_type, status, started_at, last_heartbeat_at
            FROM worker_heartbeats
            WHERE worker_id = $1
            "#,
        )
        .bind(worker_id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| heartbeat_error("get", e))?;

        row.map(|r| decode_heartbeat(&r)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list(&self) -> Result<Vec<WorkerHeartbeat>, HeartbeatError> {
        let rows = sqlx::query(
            r#"
            SELECT worker_id, worker_type, status, started_at, last_heartbeat_at
            FROM worker_heartbeats
            ORDER BY last_heartbeat_at DESC, worker_id ASC
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| heartbeat_error("list", e))?;

        rows.iter().map(decode_heartbeat).collect()
    }

    #[instrument(skip(self), err)]
    async fn latest_by_type(
        &self,
        worker_type: &str,
    ) -> Result<Option<WorkerHeartbeat>, HeartbeatError> {
        let row = sqlx::query(
            r#"
            SELECT worker_id, worker_type, status, started_at, last_heartbeat_at
            FROM worker_heartbeats
            WHERE worker_type = $1
            ORDER BY last_heartbeat_at DESC
            LIMIT 1
            "#,
        )
        .bind(worker_type)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| heartbeat_error("latest_by_type", e))?;

        row.map(|r| decode_heartbeat(&r)).transpose()
    }
}

fn heartbeat_error(operation: &str, err: sqlx::Error) -> HeartbeatError {
    match map_sqlx_error(operation, err) {
        SqlFault::Unavailable { class, message } => HeartbeatError::Unavailable { class, message },
        SqlFault::Storage(message) => HeartbeatError::Storage(message),
    }
}

fn decode_heartbeat(row: &sqlx::postgres::PgRow) -> Result<WorkerHeartbeat, HeartbeatError> {
    let decode = |e: sqlx::Error| heartbeat_error("decode_heartbeat", e);

    let worker_id: String = row.try_get("worker_id").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    let started_at: DateTime<Utc> = row.try_get("started_at").map_err(decode)?;
    let last_heartbeat_at: DateTime<Utc> = row.try_get("last_heartbeat_at").map_err(decode)?;

    Ok(WorkerHeartbeat {
        worker_id: worker_id
            .parse()
            .map_err(|e| HeartbeatError::Storage(format!("{e}")))?,
        worker_type: row.try_get("worker_type").map_err(decode)?,
        status: status
            .parse()
            .map_err(|e| HeartbeatError::Storage(format!("{e}")))?,
        started_at,
        last_heartbeat_at,
    })
}
