//! Worker runtime: polls the queue, runs handlers, reports outcomes.

pub mod handler;
pub mod runtime;

pub use handler::{HandlerError, HandlerRegistry, JobHandler};
pub use runtime::{WorkerConfig, WorkerError, WorkerRuntime, WorkerState, WorkerStats};
