//! The connection resilience guard.
//!
//! All connection acquisition goes through [`ConnectionGuard::acquire`]:
//!
//! 1. pre-flight: the descriptor is checked against the [`ConnectionContract`];
//!    a violation fails immediately and consumes no retry budget
//! 2. each failed attempt is classified and charged to its class budget
//! 3. auth failures retry a few times on a fixed delay, then give up for good;
//!    network blips back off exponentially with jitter on a larger budget

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use tracing::{error, info, warn};

use super::classify::{ConnectFailure, FailureClass, classify};
use super::contract::{
    ConnectionContract, ConnectionDescriptor, ContractViolation, SslMode, TransportMode,
};
use super::policy::{GuardPolicies, RetryDecision, RetryTracker};

/// Opens a connection (or pool) for a descriptor.
///
/// Implemented by [`PgConnector`] in production and by test doubles.
#[async_trait]
pub trait Connector: Send + Sync {
    type Connection: Send;

    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Self::Connection, ConnectFailure>;
}

/// Guard error. Every variant is final: the guard already spent whatever
/// retry budget applied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuardError {
    #[error("connection descriptor violates contract: {}", join_violations(.0))]
    Contract(Vec<ContractViolation>),
    #[error("authentication failed after {attempts} attempts: {last_error}")]
    AuthExhausted { attempts: u32, last_error: String },
    #[error("store unreachable after {attempts} attempts: {last_error}")]
    TransientExhausted { attempts: u32, last_error: String },
    /// Unclassified failures get the auth budget but are not reported as
    /// credential problems.
    #[error("connection failed after {attempts} attempts with an unclassified error: {last_error}")]
    UnclassifiedExhausted { attempts: u32, last_error: String },
    #[error("connection rejected as misconfigured: {0}")]
    Misconfigured(String),
}

fn join_violations(v: &[ContractViolation]) -> String {
    v.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

impl GuardError {
    /// Configuration problems, as opposed to failed connections.
    pub fn is_config(&self) -> bool {
        matches!(self, GuardError::Contract(_) | GuardError::Misconfigured(_))
    }

    /// Process exit code for supervisors (`EX_CONFIG` for configuration).
    pub fn exit_code(&self) -> i32 {
        match self {
            GuardError::Contract(_) | GuardError::Misconfigured(_) => 78,
            GuardError::AuthExhausted { .. } => 2,
            GuardError::TransientExhausted { .. } | GuardError::UnclassifiedExhausted { .. } => 1,
        }
    }
}

/// Result of one attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Ok,
    Failed(FailureClass),
}

/// Ephemeral record of one connection attempt. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionAttempt {
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    /// Backoff applied before the next attempt, if any.
    pub backoff: Option<Duration>,
}

/// Connection resilience guard.
pub struct ConnectionGuard<C: Connector> {
    connector: C,
    descriptor: ConnectionDescriptor,
    contract: ConnectionContract,
    policies: GuardPolicies,
    last_attempts: Mutex<Vec<ConnectionAttempt>>,
}

impl<C: Connector> ConnectionGuard<C> {
    pub fn new(connector: C, descriptor: ConnectionDescriptor) -> Self {
        Self {
            connector,
            descriptor,
            contract: ConnectionContract::default(),
            policies: GuardPolicies::default(),
            last_attempts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_contract(mut self, contract: ConnectionContract) -> Self {
        self.contract = contract;
        self
    }

    pub fn with_policies(mut self, policies: GuardPolicies) -> Self {
        self.policies = policies;
        self
    }

    pub fn policies(&self) -> &GuardPolicies {
        &self.policies
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    /// Attempts made by the most recent [`ConnectionGuard::acquire`].
    pub fn last_attempts(&self) -> Vec<ConnectionAttempt> {
        self.last_attempts.lock().unwrap().clone()
    }

    /// Validate the descriptor without touching the network.
    pub fn preflight(&self) -> Result<(), GuardError> {
        self.contract
            .validate(&self.descriptor)
            .map_err(GuardError::Contract)
    }

    /// Acquire a connection under the asymmetric retry policy.
    pub async fn acquire(&self) -> Result<C::Connection, GuardError> {
        self.last_attempts.lock().unwrap().clear();

        if let Err(err) = self.preflight() {
            error!(
                host = %self.descriptor.host,
                port = self.descriptor.port,
                error = %err,
                "connection descriptor rejected before connecting"
            );
            return Err(err);
        }

        let mut tracker = RetryTracker::new(self.policies.clone());
        let mut attempt = 1u32;

        loop {
            match self.connector.connect(&self.descriptor).await {
                Ok(conn) => {
                    self.record(attempt, AttemptOutcome::Ok, None);
                    info!(
                        host = %self.descriptor.host,
                        attempt,
                        "connected"
                    );
                    return Ok(conn);
                }
                Err(failure) => {
                    let class = classify(&failure);
                    match tracker.record(class) {
                        RetryDecision::Retry { delay, .. } => {
                            self.record(attempt, AttemptOutcome::Failed(class), Some(delay));
                            warn!(
                                class = %class,
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %failure.message,
                                "connection attempt failed, backing off"
                            );
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        }
                        RetryDecision::GiveUp { attempts } => {
                            self.record(attempt, AttemptOutcome::Failed(class), None);
                            error!(
                                class = %class,
                                attempts,
                                error = %failure.message,
                                "connection retry budget exhausted"
                            );
                            return Err(match class {
                                FailureClass::TransientNetwork => GuardError::TransientExhausted {
                                    attempts,
                                    last_error: failure.message,
                                },
                                FailureClass::AuthFailure => GuardError::AuthExhausted {
                                    attempts,
                                    last_error: failure.message,
                                },
                                _ => GuardError::UnclassifiedExhausted {
                                    attempts,
                                    last_error: failure.message,
                                },
                            });
                        }
                        RetryDecision::Fatal => {
                            self.record(attempt, AttemptOutcome::Failed(class), None);
                            error!(error = %failure.message, "connection rejected as misconfigured");
                            return Err(GuardError::Misconfigured(failure.message));
                        }
                    }
                }
            }
        }
    }

    fn record(&self, attempt: u32, outcome: AttemptOutcome, backoff: Option<Duration>) {
        self.last_attempts.lock().unwrap().push(ConnectionAttempt {
            attempt,
            outcome,
            backoff,
        });
    }
}

// sqlx's own default.
const DIRECT_STATEMENT_CACHE: usize = 100;

/// Production connector: builds a sqlx `PgPool` from the descriptor.
#[derive(Debug, Clone)]
pub struct PgConnector {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PgConnector {
    fn default() -> Self {
        Self {
            max_connections: 4,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

impl PgConnector {
    /// Prepared-statement cache size for a transport. Transaction-mode
    /// poolers cannot keep prepared statements across transactions.
    fn statement_cache_capacity(transport: TransportMode) -> usize {
        match transport {
            TransportMode::Pooler => 0,
            TransportMode::Direct => DIRECT_STATEMENT_CACHE,
        }
    }

    fn connect_options(descriptor: &ConnectionDescriptor) -> PgConnectOptions {
        let ssl_mode = match descriptor.ssl_mode {
            SslMode::Disable => PgSslMode::Disable,
            SslMode::Prefer => PgSslMode::Prefer,
            SslMode::Require => PgSslMode::Require,
            SslMode::VerifyCa => PgSslMode::VerifyCa,
            SslMode::VerifyFull => PgSslMode::VerifyFull,
        };

        PgConnectOptions::new()
            .host(&descriptor.host)
            .port(descriptor.port)
            .username(&descriptor.user)
            .password(&descriptor.password)
            .database(&descriptor.database)
            .ssl_mode(ssl_mode)
            .application_name("collectq")
            .statement_cache_capacity(Self::statement_cache_capacity(descriptor.transport))
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Connection = PgPool;

    async fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<PgPool, ConnectFailure> {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
            .connect_with(Self::connect_options(descriptor))
            .await
            .map_err(|e| ConnectFailure::from(&e))
    }
}
