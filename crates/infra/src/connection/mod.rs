//! Connection resilience guard.
//!
//! ## Components
//!
//! - `classify`: sorts driver failures into auth / transient / config / unknown
//! - `contract`: the connection descriptor and its pre-flight contract
//! - `policy`: per-class retry policies and the in-process retry budget
//! - `guard`: `ConnectionGuard`, the only path to a connection

pub mod classify;
pub mod contract;
pub mod guard;
pub mod policy;

pub use classify::{ConnectFailure, FailureClass, classify, classify_message, classify_sqlx_error};
pub use contract::{
    ConnectionContract, ConnectionDescriptor, ContractViolation, SslMode, TransportMode,
};
pub use guard::{
    AttemptOutcome, ConnectionAttempt, ConnectionGuard, Connector, GuardError, PgConnector,
};
pub use policy::{BackoffStrategy, GuardPolicies, RetryDecision, RetryPolicy, RetryTracker};
