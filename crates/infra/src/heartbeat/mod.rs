//! Worker liveness registry.
//!
//! Each worker upserts its row once per poll cycle. Nothing is ever deleted:
//! a crashed worker simply stops writing, and [`WorkerHeartbeat::is_online`]
//! turns the growing staleness into an "offline" verdict.

pub mod postgres;

use core::str::FromStr;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use collectq_core::{DomainError, WorkerId};

use crate::connection::{ConnectFailure, FailureClass};

pub use postgres::PostgresHeartbeatStore;

/// Lifecycle status a worker reports about itself.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Running,
    Stopping,
    Stopped,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Running => "running",
            WorkerStatus::Stopping => "stopping",
            WorkerStatus::Stopped => "stopped",
        }
    }
}

impl FromStr for WorkerStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(WorkerStatus::Running),
            "stopping" => Ok(WorkerStatus::Stopping),
            "stopped" => Ok(WorkerStatus::Stopped),
            other => Err(DomainError::validation(format!(
                "unknown worker status '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: WorkerId,
    pub worker_type: String,
    pub status: WorkerStatus,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

impl WorkerHeartbeat {
    /// `now - last_heartbeat_at < window`. A heartbeat stamped in the future
    /// (clock skew between hosts) counts as online.
    pub fn is_online(&self, now: DateTime<Utc>, window: Duration) -> bool {
        is_online(self.last_heartbeat_at, now, window)
    }
}

/// Liveness derivation over a bare timestamp.
pub fn is_online(last_heartbeat_at: DateTime<Utc>, now: DateTime<Utc>, window: Duration) -> bool {
    let Ok(window) = chrono::Duration::from_std(window) else {
        return true;
    };
    now.signed_duration_since(last_heartbeat_at) < window
}

/// Heartbeat persistence.
#[async_trait]
pub trait HeartbeatStore: Send + Sync {
    /// Upsert `last_heartbeat_at = now`, `status = running`.
    async fn record_heartbeat(
        &self,
        worker_id: &WorkerId,
        worker_type: &str,
    ) -> Result<(), HeartbeatError>;

    /// Set the status of an existing row (`stopping`, `stopped`).
    async fn mark_status(
        &self,
        worker_id: &WorkerId,
        status: WorkerStatus,
    ) -> Result<(), HeartbeatError>;

    async fn get(&self, worker_id: &WorkerId) -> Result<Option<WorkerHeartbeat>, HeartbeatError>;

    /// All rows, most recent heartbeat first.
    async fn list(&self) -> Result<Vec<WorkerHeartbeat>, HeartbeatError>;

    /// The freshest row of a worker type.
    async fn latest_by_type(
        &self,
        worker_type: &str,
    ) -> Result<Option<WorkerHeartbeat>, HeartbeatError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeartbeatError {
    #[error("worker not registered: {0}")]
    UnknownWorker(WorkerId),
    #[error("heartbeat store unavailable ({class}): {message}")]
    Unavailable { class: FailureClass, message: String },
    #[error("heartbeat storage error: {0}")]
    Storage(String),
}

impl HeartbeatError {
    pub fn failure_class(&self) -> Option<FailureClass> {
        match self {
            HeartbeatError::Unavailable { class, .. } => Some(*class),
            _ => None,
        }
    }
}

impl From<ConnectFailure> for HeartbeatError {
    fn from(failure: ConnectFailure) -> Self {
        HeartbeatError::Unavailable {
            class: failure.class,
            message: failure.message,
        }
    }
}

/// In-memory heartbeat registry for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryHeartbeatStore {
    rows: Mutex<HashMap<WorkerId, WorkerHeartbeat>>,
    outage: Mutex<Option<ConnectFailure>>,
}

impl InMemoryHeartbeatStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with `failure` until cleared with `None`.
    pub fn simulate_outage(&self, failure: Option<ConnectFailure>) {
        *self.outage.lock().unwrap() = failure;
    }

    /// Upsert with an explicit timestamp, e.g. to age a worker in tests.
    pub fn record_at(&self, worker_id: &WorkerId, worker_type: &str, at: DateTime<Utc>) {
        let mut rows = self.rows.lock().unwrap();
        rows.entry(worker_id.clone())
            .and_modify(|hb| {
                hb.worker_type = worker_type.to_string();
                hb.status = WorkerStatus::Running;
                hb.last_heartbeat_at = at;
            })
            .or_insert_with(|| WorkerHeartbeat {
                worker_id: worker_id.clone(),
                worker_type: worker_type.to_string(),
                status: WorkerStatus::Running,
                started_at: at,
                last_heartbeat_at: at,
            });
    }

    fn check_available(&self) -> Result<(), HeartbeatError> {
        match self.outage.lock().unwrap().as_ref() {
            Some(failure) => Err(failure.clone().into()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl HeartbeatStore for InMemoryHeartbeatStore {
    async fn record_heartbeat(
        &self,
        worker_id: &WorkerId,
        worker_type: &str,
    ) -> Result<(), HeartbeatError> {
        self.check_available()?;
        self.record_at(worker_id, worker_type, Utc::now());
        Ok(())
    }

    async fn mark_status(
        &self,
        worker_id: &WorkerId,
        status: WorkerStatus,
    ) -> Result<(), HeartbeatError> {
        self.check_available()?;
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .get_mut(worker_id)
            .ok_or_else(|| HeartbeatError::UnknownWorker(worker_id.clone()))?;
        row.status = status;
        Ok(())
    }

    async fn get(&self, worker_id: &WorkerId) -> Result<Option<WorkerHeartbeat>, HeartbeatError> {
        self.check_available()?;
        Ok(self.rows.lock().unwrap().get(worker_id).cloned())
    }

    async fn list(&self) -> Result<Vec<WorkerHeartbeat>, HeartbeatError> {
        self.check_available()?;
        let mut all: Vec<_> = self.rows.lock().unwrap().values().cloned().collect();
        all.sort_by(|a, b| {
            b.last_heartbeat_at
                .cmp(&a.last_heartbeat_at)
                .then_with(|| a.worker_id.cmp(&b.worker_id))
        });
        Ok(all)
    }

    async fn latest_by_type(
        &self,
        worker_type: &str,
    ) -> Result<Option<WorkerHeartbeat>, HeartbeatError> {
        self.check_available()?;
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|hb| hb.worker_type == worker_type)
            .max_by_key(|hb| hb.last_heartbeat_at)
            .cloned())
    }
}
