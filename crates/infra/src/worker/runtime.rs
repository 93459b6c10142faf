//! The per-process worker loop.
//!
//! ```text
//! Starting → Polling → (Executing → Polling)* → Stopping → Stopped
//! ```
//!
//! Each cycle records a heartbeat, then tries `claim_next` over the claimable
//! job types, starting one type further along every cycle so a busy type
//! cannot starve the others. A claimed job runs on its own task; whatever
//! happens to it (result, error, panic, timeout, shutdown abort) is written
//! back as exactly one `complete` or `fail`. While a handler runs the
//! heartbeat keeps beating every `heartbeat_interval`, so a long job does not
//! make a busy worker look dead.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, info_span, warn};

use collectq_core::WorkerId;

use super::handler::HandlerRegistry;
use crate::connection::{FailureClass, GuardPolicies, RetryDecision, RetryTracker};
use crate::heartbeat::{HeartbeatStore, WorkerStatus};
use crate::jobs::{Job, JobStore, JobStoreError, JobType, Transition};
use crate::shutdown::ShutdownSignal;

/// Observable lifecycle state of a worker.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Polling,
    Executing,
    Stopping,
    Stopped,
}

/// Worker runtime configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: WorkerId,
    /// Logical role, e.g. `ingest`; used by liveness queries.
    pub worker_type: String,
    /// Types to claim. Empty means every registered type.
    pub job_types: Vec<JobType>,
    /// Sleep between polls that found nothing.
    pub poll_interval: Duration,
    /// Heartbeat period while a job is executing.
    pub heartbeat_interval: Duration,
    /// Abort a handler that runs longer than this.
    pub handler_timeout: Option<Duration>,
    /// How long an in-flight job may keep running after shutdown.
    pub shutdown_grace: Duration,
    /// Consecutive handler failures that end the run.
    pub max_consecutive_failures: u32,
    /// Retry budget for store errors.
    pub store_policies: GuardPolicies,
}

impl WorkerConfig {
    pub fn new(worker_id: WorkerId, worker_type: impl Into<String>) -> Self {
        Self {
            worker_id,
            worker_type: worker_type.into(),
            job_types: Vec::new(),
            poll_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            handler_timeout: None,
            shutdown_grace: Duration::from_secs(30),
            max_consecutive_failures: 10,
            store_policies: GuardPolicies::default(),
        }
    }

    pub fn with_job_types(mut self, job_types: Vec<JobType>) -> Self {
        self.job_types = job_types;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_max_consecutive_failures(mut self, max: u32) -> Self {
        self.max_consecutive_failures = max;
        self
    }
}

/// Why a worker stopped other than by request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    #[error("crash loop: {consecutive} consecutive handler failures, last: {last_error}")]
    CrashLoop { consecutive: u32, last_error: String },
    #[error("store failure ({class}) after {attempts} attempts: {message}")]
    Infrastructure {
        class: FailureClass,
        attempts: u32,
        message: String,
    },
    #[error("worker has no job types to claim")]
    NoJobTypes,
}

impl WorkerError {
    /// Process exit code for supervisors.
    pub fn exit_code(&self) -> i32 {
        match self {
            WorkerError::CrashLoop { .. } => 3,
            WorkerError::Infrastructure { class, .. } => class.exit_code(),
            WorkerError::NoJobTypes => 78,
        }
    }
}

/// Counters for one `run`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub cycles: u64,
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
}

/// How a claimed job ended, before it is written back.
#[derive(Debug, Clone, PartialEq)]
enum JobOutcome {
    Completed(Value),
    Failed { error: String, retry: bool },
}

pub struct WorkerRuntime {
    config: WorkerConfig,
    jobs: Arc<dyn JobStore>,
    heartbeats: Arc<dyn HeartbeatStore>,
    registry: HandlerRegistry,
    state_tx: watch::Sender<WorkerState>,
}

impl WorkerRuntime {
    pub fn new(
        config: WorkerConfig,
        jobs: Arc<dyn JobStore>,
        heartbeats: Arc<dyn HeartbeatStore>,
        registry: HandlerRegistry,
    ) -> Self {
        let (state_tx, _rx) = watch::channel(WorkerState::Starting);
        Self {
            config,
            jobs,
            heartbeats,
            registry,
            state_tx,
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.config.worker_id
    }

    /// Subscribe to state changes.
    pub fn state(&self) -> watch::Receiver<WorkerState> {
        self.state_tx.subscribe()
    }

    fn claim_types(&self) -> Vec<JobType> {
        if self.config.job_types.is_empty() {
            self.registry.job_types()
        } else {
            self.config.job_types.clone()
        }
    }

    /// Run until `shutdown` fires (`Ok`) or the worker must give up (`Err`).
    pub async fn run(&self, shutdown: ShutdownSignal) -> Result<WorkerStats, WorkerError> {
        self.set_state(WorkerState::Starting);

        let claim_types = self.claim_types();
        if claim_types.is_empty() {
            return Err(WorkerError::NoJobTypes);
        }

        let type_names: Vec<&str> = claim_types.iter().map(JobType::as_str).collect();
        info!(
            worker_id = %self.config.worker_id,
            worker_type = %self.config.worker_type,
            job_types = ?type_names,
            "worker started"
        );

        let mut tracker = RetryTracker::new(self.config.store_policies.clone());
        let mut stats = WorkerStats::default();
        let mut consecutive_failures = 0u32;
        let mut rotation = 0usize;

        let result = loop {
            if shutdown.is_triggered() {
                break Ok(());
            }
            self.set_state(WorkerState::Polling);
            stats.cycles += 1;

            if let Err(e) = self
                .heartbeats
                .record_heartbeat(&self.config.worker_id, &self.config.worker_type)
                .await
            {
                let class = e.failure_class().unwrap_or(FailureClass::Unknown);
                match self.store_failure(&mut tracker, "record_heartbeat", class, e.to_string()) {
                    Ok(delay) => {
                        self.idle(delay, &shutdown).await;
                        continue;
                    }
                    Err(fatal) => break Err(fatal),
                }
            }

            let claimed = match self.claim_any(&claim_types, rotation).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    let class = e.failure_class().unwrap_or(FailureClass::Unknown);
                    match self.store_failure(&mut tracker, "claim_next", class, e.to_string()) {
                        Ok(delay) => {
                            self.idle(delay, &shutdown).await;
                            continue;
                        }
                        Err(fatal) => break Err(fatal),
                    }
                }
            };
            rotation = rotation.wrapping_add(1);
            tracker.reset();

            let Some(job) = claimed else {
                self.idle(self.config.poll_interval, &shutdown).await;
                continue;
            };

            self.set_state(WorkerState::Executing);
            let span = info_span!("job", job_id = %job.id, job_type = %job.job_type);
            let outcome = self.execute(&job, &shutdown).instrument(span.clone()).await;

            stats.jobs_processed += 1;
            if let Err(fatal) = self
                .write_back(&job, &outcome, &mut tracker)
                .instrument(span)
                .await
            {
                break Err(fatal);
            }

            match outcome {
                JobOutcome::Completed(_) => {
                    stats.jobs_succeeded += 1;
                    consecutive_failures = 0;
                }
                JobOutcome::Failed { error, .. } => {
                    stats.jobs_failed += 1;
                    consecutive_failures += 1;
                    if consecutive_failures >= self.config.max_consecutive_failures {
                        error!(
                            worker_id = %self.config.worker_id,
                            consecutive_failures,
                            last_error = %error,
                            "crash loop detected, stopping worker"
                        );
                        break Err(WorkerError::CrashLoop {
                            consecutive: consecutive_failures,
                            last_error: error,
                        });
                    }
                }
            }
        };

        match result {
            Ok(()) => {
                self.begin_stopping().await;
                self.announce(WorkerStatus::Stopped).await;
                self.set_state(WorkerState::Stopped);
                info!(
                    worker_id = %self.config.worker_id,
                    processed = stats.jobs_processed,
                    succeeded = stats.jobs_succeeded,
                    failed = stats.jobs_failed,
                    "worker stopped"
                );
                Ok(stats)
            }
            Err(e) => {
                // The heartbeat row is left as-is; staleness reports the death.
                self.set_state(WorkerState::Stopped);
                Err(e)
            }
        }
    }

    async fn claim_any(
        &self,
        claim_types: &[JobType],
        rotation: usize,
    ) -> Result<Option<Job>, JobStoreError> {
        let n = claim_types.len();
        for i in 0..n {
            let job_type = &claim_types[(rotation + i) % n];
            if let Some(job) = self
                .jobs
                .claim_next(job_type, &self.config.worker_id)
                .await?
            {
                debug!(job_id = %job.id, job_type = %job_type, "claimed job");
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    async fn execute(&self, job: &Job, shutdown: &ShutdownSignal) -> JobOutcome {
        let Some(handler) = self.registry.get(&job.job_type) else {
            return JobOutcome::Failed {
                error: format!("no handler registered for job type '{}'", job.job_type),
                retry: false,
            };
        };

        let payload = job.payload.clone();
        let mut task = tokio::spawn(
            async move { handler.handle(payload).await }.in_current_span(),
        );

        let handler_timeout = self.config.handler_timeout;
        let deadline = async move {
            match handler_timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        let joined = tokio::select! {
            joined = &mut task => joined,
            never = self.pulse() => match never {},
            _ = deadline => {
                task.abort();
                let limit = handler_timeout.unwrap_or_default();
                warn!(timeout_ms = limit.as_millis() as u64, "handler timed out, aborted");
                return JobOutcome::Failed {
                    error: format!("handler timed out after {}ms", limit.as_millis()),
                    retry: true,
                };
            }
            _ = shutdown.triggered() => {
                self.begin_stopping().await;
                info!(grace_ms = self.config.shutdown_grace.as_millis() as u64, "shutdown requested, waiting for in-flight job");
                match tokio::time::timeout(self.config.shutdown_grace, &mut task).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        task.abort();
                        warn!("shutdown grace elapsed, in-flight job aborted");
                        return JobOutcome::Failed {
                            error: "aborted at shutdown after grace period".to_string(),
                            retry: true,
                        };
                    }
                }
            }
        };

        match joined {
            Ok(Ok(result)) => JobOutcome::Completed(result),
            Ok(Err(e)) => {
                warn!(error = %e.message, retryable = e.retryable, "handler failed");
                JobOutcome::Failed {
                    error: e.message,
                    retry: e.retryable,
                }
            }
            Err(join_err) if join_err.is_panic() => {
                let message = panic_message(join_err.into_panic());
                error!(panic = %message, "handler panicked");
                JobOutcome::Failed {
                    error: format!("handler panicked: {message}"),
                    retry: true,
                }
            }
            Err(join_err) => JobOutcome::Failed {
                error: format!("handler task cancelled: {join_err}"),
                retry: true,
            },
        }
    }

    /// Beat every `heartbeat_interval` until dropped. Failures here are only
    /// logged; the next poll cycle charges them to the retry budget.
    async fn pulse(&self) -> Infallible {
        let period = self.config.heartbeat_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self
                .heartbeats
                .record_heartbeat(&self.config.worker_id, &self.config.worker_type)
                .await
            {
                warn!(error = %e, "heartbeat during job failed");
            }
        }
    }

    /// Persist the outcome, retrying store errors under the tracker's budget.
    ///
    /// Giving up leaves the row `processing`; the reaper will return it.
    async fn write_back(
        &self,
        job: &Job,
        outcome: &JobOutcome,
        tracker: &mut RetryTracker,
    ) -> Result<(), WorkerError> {
        loop {
            let written = match outcome {
                JobOutcome::Completed(result) => self.jobs.complete(job.id, result.clone()).await,
                JobOutcome::Failed { error, retry } => self.jobs.fail(job.id, error, *retry).await,
            };

            match written {
                Ok(Transition::Applied(status)) => {
                    info!(%status, attempts = job.attempts, "job resolved");
                    return Ok(());
                }
                Ok(Transition::Unchanged(status)) => {
                    // Typically the reaper released it after lock_timeout.
                    warn!(%status, "job no longer held by this worker, outcome dropped");
                    return Ok(());
                }
                Err(JobStoreError::NotFound(_)) => {
                    warn!("job vanished before its outcome was written");
                    return Ok(());
                }
                Err(e) => {
                    let class = e.failure_class().unwrap_or(FailureClass::Unknown);
                    let delay = self.store_failure(tracker, "write_back", class, e.to_string())?;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Charge a store error to the retry budget. `Ok(delay)` means back off
    /// and try again.
    fn store_failure(
        &self,
        tracker: &mut RetryTracker,
        operation: &'static str,
        class: FailureClass,
        message: String,
    ) -> Result<Duration, WorkerError> {
        match tracker.record(class) {
            RetryDecision::Retry { next_attempt, delay } => {
                warn!(
                    operation,
                    %class,
                    next_attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "store operation failed, backing off"
                );
                Ok(delay)
            }
            RetryDecision::GiveUp { attempts } => {
                error!(operation, %class, attempts, error = %message, "store retry budget exhausted");
                Err(WorkerError::Infrastructure {
                    class,
                    attempts,
                    message,
                })
            }
            RetryDecision::Fatal => {
                error!(operation, %class, error = %message, "store rejected configuration");
                Err(WorkerError::Infrastructure {
                    class,
                    attempts: 1,
                    message,
                })
            }
        }
    }

    async fn idle(&self, delay: Duration, shutdown: &ShutdownSignal) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.triggered() => {}
        }
    }

    async fn begin_stopping(&self) {
        if *self.state_tx.borrow() == WorkerState::Stopping {
            return;
        }
        self.set_state(WorkerState::Stopping);
        self.announce(WorkerStatus::Stopping).await;
    }

    async fn announce(&self, status: WorkerStatus) {
        if let Err(e) = self
            .heartbeats
            .mark_status(&self.config.worker_id, status)
            .await
        {
            warn!(worker_id = %self.config.worker_id, %status, error = %e, "could not update heartbeat status");
        }
    }

    fn set_state(&self, state: WorkerState) {
        self.state_tx.send_replace(state);
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectFailure, RetryPolicy};
    use crate::heartbeat::InMemoryHeartbeatStore;
    use crate::jobs::{InMemoryJobStore, JobId, JobStatus, NewJob};
    use crate::worker::handler::HandlerError;
    use serde_json::json;
    use std::sync::Mutex;

    fn config() -> WorkerConfig {
        WorkerConfig::new("test-worker".parse().unwrap(), "test")
            .with_poll_interval(Duration::from_millis(100))
            .with_shutdown_grace(Duration::from_secs(2))
    }

    fn echo_registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register_fn(JobType::IngestCsv, |payload: Value| async move {
            Ok(json!({ "echo": payload }))
        });
        registry
    }

    struct Harness {
        jobs: Arc<InMemoryJobStore>,
        heartbeats: Arc<InMemoryHeartbeatStore>,
        runtime: Arc<WorkerRuntime>,
        shutdown: ShutdownSignal,
    }

    impl Harness {
        fn new(config: WorkerConfig, registry: HandlerRegistry) -> Self {
            let jobs = InMemoryJobStore::arc();
            let heartbeats = Arc::new(InMemoryHeartbeatStore::new());
            let runtime = Arc::new(WorkerRuntime::new(
                config,
                jobs.clone(),
                heartbeats.clone(),
                registry,
            ));
            Self {
                jobs,
                heartbeats,
                runtime,
                shutdown: ShutdownSignal::new(),
            }
        }

        fn spawn(&self) -> tokio::task::JoinHandle<Result<WorkerStats, WorkerError>> {
            let runtime = self.runtime.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move { runtime.run(shutdown).await })
        }

        async fn enqueue(&self, job: NewJob) -> JobId {
            self.jobs.enqueue(job).await.unwrap()
        }

        async fn wait_for_status(&self, id: JobId, status: JobStatus) -> Job {
            for _ in 0..2000 {
                let job = self.jobs.get(id).await.unwrap().unwrap();
                if job.status == status {
                    return job;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            panic!("job {id} never reached {status}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn processes_jobs_then_stops_cleanly() {
        let h = Harness::new(config(), echo_registry());
        let mut ids = Vec::new();
        for i in 0..3 {
            ids.push(
                h.enqueue(NewJob::new(JobType::IngestCsv, json!({ "row": i })))
                    .await,
            );
        }

        let handle = h.spawn();
        for id in &ids {
            let job = h.wait_for_status(*id, JobStatus::Completed).await;
            assert!(job.result.is_some());
            job.check_invariants().unwrap();
        }

        h.shutdown.trigger();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.jobs_succeeded, 3);
        assert_eq!(stats.jobs_failed, 0);

        let hb = h
            .heartbeats
            .get(h.runtime.worker_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hb.status, WorkerStatus::Stopped);
        assert_eq!(hb.worker_type, "test");
        assert_eq!(*h.runtime.state().borrow(), WorkerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_handler_error_fails_without_retry() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn(JobType::Enforce, |_payload: Value| async move {
            Err(HandlerError::permanent("judgment amount missing"))
        });
        let h = Harness::new(config(), registry);
        let id = h.enqueue(NewJob::new(JobType::Enforce, json!({}))).await;

        let handle = h.spawn();
        let job = h.wait_for_status(id, JobStatus::Failed).await;
        assert_eq!(job.attempts, 0);
        assert_eq!(job.last_error.as_deref(), Some("judgment amount missing"));

        h.shutdown.trigger();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn panics_are_retried_until_the_bound() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn(JobType::Enrich, |_payload: Value| async move {
            if true {
                panic!("vendor client exploded");
            }
            Ok(Value::Null)
        });
        let h = Harness::new(config(), registry);
        let id = h
            .enqueue(NewJob::new(JobType::Enrich, json!({})).with_max_attempts(2))
            .await;

        let handle = h.spawn();
        let job = h.wait_for_status(id, JobStatus::Failed).await;
        assert_eq!(job.attempts, 2);
        assert!(
            job.last_error
                .as_deref()
                .unwrap()
                .contains("vendor client exploded")
        );

        h.shutdown.trigger();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.jobs_failed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn crash_loop_ends_the_run() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn(JobType::IngestCsv, |_payload: Value| async move {
            Err(HandlerError::retryable("upstream 503"))
        });
        let h = Harness::new(config().with_max_consecutive_failures(3), registry);
        h.enqueue(NewJob::new(JobType::IngestCsv, json!({})).with_max_attempts(100))
            .await;

        let err = h.spawn().await.unwrap().unwrap_err();
        assert_eq!(
            err,
            WorkerError::CrashLoop {
                consecutive: 3,
                last_error: "upstream 503".to_string()
            }
        );
        assert_eq!(err.exit_code(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_the_crash_counter() {
        let calls = Arc::new(Mutex::new(0u32));
        let mut registry = HandlerRegistry::new();
        {
            let calls = calls.clone();
            registry.register_fn(JobType::IngestCsv, move |_payload: Value| {
                let calls = calls.clone();
                async move {
                    let n = {
                        let mut c = calls.lock().unwrap();
                        *c += 1;
                        *c
                    };
                    // fail, fail, succeed, repeat
                    if n % 3 == 0 {
                        Ok(Value::Null)
                    } else {
                        Err(HandlerError::retryable("flaky"))
                    }
                }
            });
        }
        let h = Harness::new(config().with_max_consecutive_failures(3), registry);
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(
                h.enqueue(NewJob::new(JobType::IngestCsv, json!({})).with_max_attempts(10))
                    .await,
            );
        }

        let handle = h.spawn();
        for id in &ids {
            h.wait_for_status(*id, JobStatus::Completed).await;
        }
        h.shutdown.trigger();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.jobs_succeeded, 3);
        assert_eq!(stats.jobs_failed, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_is_timed_out() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn(JobType::Enrich, |_payload: Value| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Value::Null)
        });
        let h = Harness::new(
            config().with_handler_timeout(Duration::from_secs(5)),
            registry,
        );
        let id = h
            .enqueue(NewJob::new(JobType::Enrich, json!({})).with_max_attempts(0))
            .await;

        let handle = h.spawn();
        let job = h.wait_for_status(id, JobStatus::Failed).await;
        assert!(job.last_error.as_deref().unwrap().contains("timed out"));

        h.shutdown.trigger();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_grace_aborts_and_requeues_in_flight_job() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn(JobType::IngestCsv, |_payload: Value| async move {
            std::future::pending::<()>().await;
            Ok(Value::Null)
        });
        let h = Harness::new(config(), registry);
        let id = h.enqueue(NewJob::new(JobType::IngestCsv, json!({}))).await;

        let mut state = h.runtime.state();
        let handle = h.spawn();
        state
            .wait_for(|s| *s == WorkerState::Executing)
            .await
            .unwrap();

        h.shutdown.trigger();
        handle.await.unwrap().unwrap();

        let job = h.jobs.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert!(job.last_error.as_deref().unwrap().contains("shutdown"));
        job.check_invariants().unwrap();

        let hb = h
            .heartbeats
            .get(h.runtime.worker_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hb.status, WorkerStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_job_finishing_within_grace_completes() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn(JobType::IngestCsv, |_payload: Value| async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(json!({"rows": 12}))
        });
        let h = Harness::new(config(), registry);
        let id = h.enqueue(NewJob::new(JobType::IngestCsv, json!({}))).await;

        let mut state = h.runtime.state();
        let handle = h.spawn();
        state
            .wait_for(|s| *s == WorkerState::Executing)
            .await
            .unwrap();
        h.shutdown.trigger();
        handle.await.unwrap().unwrap();

        let job = h.jobs.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(json!({"rows": 12})));
    }

    #[tokio::test(start_paused = true)]
    async fn job_type_without_handler_fails_terminally() {
        let h = Harness::new(
            config().with_job_types(vec![JobType::IngestCsv, JobType::Enrich]),
            echo_registry(),
        );
        let id = h.enqueue(NewJob::new(JobType::Enrich, json!({}))).await;

        let handle = h.spawn();
        let job = h.wait_for_status(id, JobStatus::Failed).await;
        assert_eq!(job.attempts, 0);
        assert!(job.last_error.as_deref().unwrap().contains("no handler"));

        h.shutdown.trigger();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn rotation_alternates_between_types() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        for job_type in [JobType::IngestCsv, JobType::Enforce] {
            let seen = seen.clone();
            let tag = job_type.as_str().to_string();
            registry.register_fn(job_type, move |_payload: Value| {
                let seen = seen.clone();
                let tag = tag.clone();
                async move {
                    seen.lock().unwrap().push(tag);
                    Ok(Value::Null)
                }
            });
        }
        let h = Harness::new(config(), registry);
        let mut last = None;
        for job_type in [JobType::IngestCsv, JobType::IngestCsv, JobType::Enforce, JobType::Enforce] {
            last = Some(h.enqueue(NewJob::new(job_type, json!({}))).await);
        }

        let handle = h.spawn();
        for _ in 0..2000 {
            if seen.lock().unwrap().len() == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        h.wait_for_status(last.unwrap(), JobStatus::Completed).await;
        h.shutdown.trigger();
        handle.await.unwrap().unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["ingest_csv", "enforce", "ingest_csv", "enforce"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn auth_outage_exhausts_the_bounded_budget() {
        let h = Harness::new(config(), echo_registry());
        h.jobs
            .simulate_outage(Some(ConnectFailure::auth("password authentication failed")));

        let started = tokio::time::Instant::now();
        let err = h.spawn().await.unwrap().unwrap_err();
        match &err {
            WorkerError::Infrastructure { class, attempts, .. } => {
                assert_eq!(*class, FailureClass::AuthFailure);
                assert_eq!(*attempts, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(err.exit_code(), 2);
        // two fixed 20s back-offs between three attempts
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(40) && elapsed < Duration::from_secs(41));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_outage_is_ridden_out() {
        let h = Harness::new(config(), echo_registry());
        let id = h.enqueue(NewJob::new(JobType::IngestCsv, json!({}))).await;
        h.jobs
            .simulate_outage(Some(ConnectFailure::transient("connection reset by peer")));

        let handle = h.spawn();
        tokio::time::sleep(Duration::from_secs(3)).await;
        h.jobs.simulate_outage(None);

        h.wait_for_status(id, JobStatus::Completed).await;
        h.shutdown.trigger();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn empty_registry_is_a_configuration_error() {
        let h = Harness::new(config(), HandlerRegistry::new());
        let err = h.runtime.run(h.shutdown.clone()).await.unwrap_err();
        assert_eq!(err, WorkerError::NoJobTypes);
        assert_eq!(err.exit_code(), 78);
    }

    #[tokio::test(start_paused = true)]
    async fn long_running_job_keeps_the_worker_online() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn(JobType::IngestCsv, |_payload: Value| async move {
            tokio::time::sleep(Duration::from_secs(120)).await;
            Ok(Value::Null)
        });
        let h = Harness::new(
            config().with_heartbeat_interval(Duration::from_secs(30)),
            registry,
        );
        let id = h.enqueue(NewJob::new(JobType::IngestCsv, json!({}))).await;

        let mut state = h.runtime.state();
        let handle = h.spawn();
        state
            .wait_for(|s| *s == WorkerState::Executing)
            .await
            .unwrap();

        // Pretend the last beat is long past, as it would be without a pulse.
        let window = Duration::from_secs(90);
        let stale = chrono::Utc::now() - chrono::Duration::minutes(10);
        h.heartbeats.record_at(h.runtime.worker_id(), "test", stale);
        let hb = h.heartbeats.get(h.runtime.worker_id()).await.unwrap().unwrap();
        assert!(!hb.is_online(chrono::Utc::now(), window));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(*state.borrow(), WorkerState::Executing);
        let hb = h.heartbeats.get(h.runtime.worker_id()).await.unwrap().unwrap();
        assert!(hb.is_online(chrono::Utc::now(), window));

        h.wait_for_status(id, JobStatus::Completed).await;
        h.shutdown.trigger();
        handle.await.unwrap().unwrap();
    }

    #[test]
    fn unclassified_store_failures_do_not_exit_as_auth() {
        let err = WorkerError::Infrastructure {
            class: FailureClass::Unknown,
            attempts: 3,
            message: "unexpected response".into(),
        };
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn store_budget_defaults_match_the_guard() {
        let cfg = config();
        assert_eq!(cfg.store_policies.auth_failure, RetryPolicy::auth_failure());
        assert_eq!(cfg.max_consecutive_failures, 10);
    }
}
