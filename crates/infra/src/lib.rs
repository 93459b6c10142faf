//! Infrastructure layer: job queue, worker runtime, liveness, recovery and
//! connection resilience.

pub mod config;
pub mod connection;
pub mod db;
pub mod health;
pub mod heartbeat;
pub mod jobs;
pub mod reaper;
pub mod shutdown;
pub mod worker;


pub use config::{ConfigError, QueueConfig, Role};
pub use shutdown::ShutdownSignal;
