//! Stuck-job reaper.
//!
//! A worker that dies mid-job leaves its row in `processing` forever. The
//! reaper periodically returns rows whose lock is older than `lock_timeout`
//! to `pending` so another worker can pick them up.
//!
//! Candidates are only a hint: each release re-checks
//! `status = 'processing' AND locked_at < cutoff` in the store, so a job the
//! worker finished between the scan and the release is left alone.
//!
//! Failed sweeps are charged to the same per-class retry budget the worker
//! uses: an auth or unclassified failure ends `run` after three attempts
//! instead of hammering the account every `sweep_interval`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::connection::{FailureClass, GuardPolicies, RetryDecision, RetryTracker};
use crate::jobs::{JobStore, JobStoreError, Transition};
use crate::shutdown::ShutdownSignal;

/// Reaper configuration.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Age after which a `processing` lock is presumed dead.
    pub lock_timeout: Duration,
    /// Time between sweeps.
    pub sweep_interval: Duration,
    /// Upper bound on rows released per sweep.
    pub batch_size: usize,
    /// Retry budget for failed sweeps.
    pub store_policies: GuardPolicies,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
            batch_size: 100,
            store_policies: GuardPolicies::default(),
        }
    }
}

/// Why the reaper stopped other than by request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("stuck-job sweeps failing ({class}) after {attempts} attempts: {message}")]
pub struct ReaperError {
    pub class: FailureClass,
    pub attempts: u32,
    pub message: String,
}

impl ReaperError {
    /// Process exit code for supervisors.
    pub fn exit_code(&self) -> i32 {
        self.class.exit_code()
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Rows that looked stuck when scanned.
    pub examined: usize,
    /// Rows actually returned to `pending`.
    pub recovered: usize,
}

pub struct StuckJobReaper {
    store: Arc<dyn JobStore>,
    config: ReaperConfig,
    recovered_total: AtomicU64,
}

impl StuckJobReaper {
    pub fn new(store: Arc<dyn JobStore>, config: ReaperConfig) -> Self {
        Self {
            store,
            config,
            recovered_total: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ReaperConfig {
        &self.config
    }

    /// Rows recovered since this reaper was created.
    pub fn recovered_total(&self) -> u64 {
        self.recovered_total.load(Ordering::Relaxed)
    }

    /// Locks taken before this instant are considered abandoned at `now`.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        stuck_cutoff(now, self.config.lock_timeout)
    }

    pub async fn sweep(&self) -> Result<SweepReport, JobStoreError> {
        self.sweep_at(Utc::now()).await
    }

    /// Sweep as if the wall clock read `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, JobStoreError> {
        let cutoff = self.cutoff(now);
        let candidates = self.store.find_stuck(cutoff, self.config.batch_size).await?;

        let mut report = SweepReport {
            examined: candidates.len(),
            recovered: 0,
        };

        for job_id in candidates {
            match self.store.release_stuck(job_id, cutoff).await {
                Ok(Transition::Applied(_)) => {
                    report.recovered += 1;
                    self.recovered_total.fetch_add(1, Ordering::Relaxed);
                    warn!(job_id = %job_id, %cutoff, "released stuck job back to pending");
                }
                Ok(Transition::Unchanged(status)) => {
                    debug!(job_id = %job_id, %status, "job resolved before release");
                }
                Err(JobStoreError::NotFound(_)) => {
                    debug!(job_id = %job_id, "job disappeared before release");
                }
                Err(e) => return Err(e),
            }
        }

        if report.examined > 0 {
            info!(
                examined = report.examined,
                recovered = report.recovered,
                recovered_total = self.recovered_total(),
                "stuck-job sweep finished"
            );
        }
        Ok(report)
    }

    /// Sweep every `sweep_interval` until `shutdown` fires.
    ///
    /// A failed sweep backs off per its failure class and is retried; a
    /// successful one resets the budget. Exhausting the budget ends the run.
    pub async fn run(&self, shutdown: ShutdownSignal) -> Result<(), ReaperError> {
        info!(
            lock_timeout_secs = self.config.lock_timeout.as_secs(),
            sweep_interval_secs = self.config.sweep_interval.as_secs(),
            "stuck-job reaper started"
        );

        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tracker = RetryTracker::new(self.config.store_policies.clone());

        let result = loop {
            tokio::select! {
                _ = shutdown.triggered() => break Ok(()),
                _ = ticker.tick() => {}
            }

            let e = match self.sweep().await {
                Ok(_) => {
                    tracker.reset();
                    continue;
                }
                Err(e) => e,
            };

            let class = e.failure_class().unwrap_or(FailureClass::Unknown);
            match tracker.record(class) {
                RetryDecision::Retry { next_attempt, delay } => {
                    warn!(
                        %class,
                        next_attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "stuck-job sweep failed, backing off"
                    );
                    tokio::select! {
                        _ = shutdown.triggered() => break Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::GiveUp { attempts } => {
                    error!(%class, attempts, error = %e, "stuck-job sweep retry budget exhausted");
                    break Err(ReaperError {
                        class,
                        attempts,
                        message: e.to_string(),
                    });
                }
                RetryDecision::Fatal => {
                    error!(%class, error = %e, "stuck-job sweep rejected as misconfigured");
                    break Err(ReaperError {
                        class,
                        attempts: 1,
                        message: e.to_string(),
                    });
                }
            }
        };

        info!(recovered_total = self.recovered_total(), "stuck-job reaper stopped");
        result
    }
}

fn stuck_cutoff(now: DateTime<Utc>, lock_timeout: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(lock_timeout)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
