//! Durable job queue with exclusive claiming.
//!
//! ## Design
//!
//! - Jobs are typed and carry an opaque JSON payload
//! - A pending job is handed to at most one worker (`FOR UPDATE SKIP LOCKED`)
//! - Retryable failures go back to `pending` until `max_attempts` is reached
//! - Every write re-checks the row's status, so stale snapshots are harmless
//!
//! ## Components
//!
//! - `Job` / `NewJob`: the row and the producer's request to create one
//! - `JobStore`: persistence trait (in-memory or Postgres)
//! - `Transition`: whether a guarded write changed the row

pub mod postgres;
pub mod store;
pub mod types;

pub use collectq_core::JobId;
pub use postgres::PostgresJobStore;
pub use store::{InMemoryJobStore, JobCounts, JobStore, JobStoreError};
pub use types::{DEFAULT_MAX_ATTEMPTS, Job, JobStatus, JobType, NewJob, Transition};
