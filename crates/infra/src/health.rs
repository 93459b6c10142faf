//! Read-only operator view: queue depth, stuck rows, worker liveness.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use collectq_core::WorkerId;

use crate::heartbeat::{HeartbeatError, HeartbeatStore, WorkerHeartbeat, WorkerStatus};
use crate::jobs::{JobCounts, JobStore, JobStoreError};

/// Thresholds the snapshot is computed against.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub lock_timeout: Duration,
    pub liveness_window: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(30 * 60),
            liveness_window: Duration::from_secs(90),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HealthError {
    #[error(transparent)]
    Jobs(#[from] JobStoreError),
    #[error(transparent)]
    Heartbeats(#[from] HeartbeatError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerHealth {
    pub worker_id: WorkerId,
    pub worker_type: String,
    pub status: WorkerStatus,
    pub online: bool,
    pub last_heartbeat_at: DateTime<Utc>,
    pub seconds_since_heartbeat: i64,
}

impl WorkerHealth {
    fn from_heartbeat(hb: WorkerHeartbeat, now: DateTime<Utc>, window: Duration) -> Self {
        Self {
            online: hb.is_online(now, window),
            seconds_since_heartbeat: now.signed_duration_since(hb.last_heartbeat_at).num_seconds(),
            worker_id: hb.worker_id,
            worker_type: hb.worker_type,
            status: hb.status,
            last_heartbeat_at: hb.last_heartbeat_at,
        }
    }
}

/// Point-in-time health of the queue and its workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub collected_at: DateTime<Utc>,
    pub jobs: JobCounts,
    /// `processing` rows whose lock is older than `lock_timeout`.
    pub stuck: u64,
    pub workers: Vec<WorkerHealth>,
}

impl HealthSnapshot {
    pub async fn collect(
        jobs: &dyn JobStore,
        heartbeats: &dyn HeartbeatStore,
        config: &HealthConfig,
    ) -> Result<Self, HealthError> {
        Self::collect_at(jobs, heartbeats, config, Utc::now()).await
    }

    pub async fn collect_at(
        jobs: &dyn JobStore,
        heartbeats: &dyn HeartbeatStore,
        config: &HealthConfig,
        now: DateTime<Utc>,
    ) -> Result<Self, HealthError> {
        let cutoff = chrono::Duration::from_std(config.lock_timeout)
            .ok()
            .and_then(|d| now.checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let counts = jobs.counts_by_status().await?;
        let stuck = jobs.count_stuck(cutoff).await?;
        let workers = heartbeats
            .list()
            .await?
            .into_iter()
            .map(|hb| WorkerHealth::from_heartbeat(hb, now, config.liveness_window))
            .collect();

        Ok(Self {
            collected_at: now,
            jobs: counts,
            stuck,
            workers,
        })
    }

    pub fn online_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.online).count()
    }

    /// Worker types with no online worker at all.
    pub fn offline_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self
            .workers
            .iter()
            .map(|w| w.worker_type.as_str())
            .filter(|t| !self.workers.iter().any(|w| w.online && w.worker_type == *t))
            .collect();
        types.sort_unstable();
        types.dedup();
        types
    }
}

/// Whether any worker of `worker_type` heartbeated within `window`.
pub async fn worker_type_online(
    heartbeats: &dyn HeartbeatStore,
    worker_type: &str,
    window: Duration,
    now: DateTime<Utc>,
) -> Result<bool, HeartbeatError> {
    Ok(heartbeats
        .latest_by_type(worker_type)
        .await?
        .is_some_and(|hb| hb.is_online(now, window)))
}
