//! Environment configuration.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `COLLECTQ_ROLE` | `all` (`worker`, `reaper`) |
//! | `COLLECTQ_WORKER_TYPE` | `default` |
//! | `COLLECTQ_WORKER_ID` | generated from type, host and pid |
//! | `COLLECTQ_JOB_TYPES` | every registered type (comma separated) |
//! | `COLLECTQ_POLL_INTERVAL_MS` | `5000` |
//! | `COLLECTQ_HEARTBEAT_INTERVAL_SECS` | `30` |
//! | `COLLECTQ_LOCK_TIMEOUT_SECS` | `1800` |
//! | `COLLECTQ_SWEEP_INTERVAL_SECS` | `60` |
//! | `COLLECTQ_REAP_BATCH_SIZE` | `100` |
//! | `COLLECTQ_LIVENESS_WINDOW_SECS` | `90` |
//! | `COLLECTQ_MAX_ATTEMPTS` | `5` |
//! | `COLLECTQ_MAX_CONSECUTIVE_FAILURES` | `10` |
//! | `COLLECTQ_SHUTDOWN_GRACE_SECS` | `30` |
//! | `COLLECTQ_HANDLER_TIMEOUT_SECS` | none |
//! | `COLLECTQ_DB_MAX_CONNECTIONS` | `4` |
//!
//! The connection descriptor comes from `DB_TRANSPORT`, `DB_HOST`,
//! `DB_PORT`, `DB_USER`, `DB_PASSWORD`, `DB_NAME` and `DB_SSLMODE`. Missing
//! descriptor fields are left empty so the pre-flight contract reports all
//! of them at once.

use core::str::FromStr;
use std::time::Duration;

use collectq_core::WorkerId;

use crate::connection::{ConnectionDescriptor, SslMode, TransportMode};
use crate::health::HealthConfig;
use crate::jobs::{DEFAULT_MAX_ATTEMPTS, JobType};
use crate::reaper::ReaperConfig;
use crate::worker::WorkerConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{key}={value:?} is invalid: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &'static str, value: &str, reason: impl ToString) -> Self {
        ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// What a `collectq-worker` process runs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Role {
    /// Worker loop plus an embedded reaper.
    #[default]
    All,
    /// Worker loop only; recovery is left to a dedicated reaper process.
    Worker,
    /// Reaper only, on its own schedule.
    Reaper,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::All => "all",
            Role::Worker => "worker",
            Role::Reaper => "reaper",
        }
    }

    pub fn runs_worker(&self) -> bool {
        matches!(self, Role::All | Role::Worker)
    }

    pub fn runs_reaper(&self) -> bool {
        matches!(self, Role::All | Role::Reaper)
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(Role::All),
            "worker" => Ok(Role::Worker),
            "reaper" => Ok(Role::Reaper),
            other => Err(format!("unknown role '{other}' (expected all, worker or reaper)")),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue and worker settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub role: Role,
    pub worker_type: String,
    pub worker_id: Option<WorkerId>,
    pub job_types: Vec<JobType>,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub lock_timeout: Duration,
    pub sweep_interval: Duration,
    pub reap_batch_size: usize,
    pub liveness_window: Duration,
    pub default_max_attempts: u32,
    pub max_consecutive_failures: u32,
    pub shutdown_grace: Duration,
    pub handler_timeout: Option<Duration>,
    pub db_max_connections: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            role: Role::default(),
            worker_type: "default".to_string(),
            worker_id: None,
            job_types: Vec::new(),
            poll_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            lock_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
            reap_batch_size: 100,
            liveness_window: Duration::from_secs(90),
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_consecutive_failures: 10,
            shutdown_grace: Duration::from_secs(30),
            handler_timeout: None,
            db_max_connections: 4,
        }
    }
}

impl QueueConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup (the environment, a map in tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let worker_id = var("COLLECTQ_WORKER_ID")
            .map(|v| {
                v.parse::<WorkerId>()
                    .map_err(|e| ConfigError::invalid("COLLECTQ_WORKER_ID", &v, e))
            })
            .transpose()?;

        let job_types = var("COLLECTQ_JOB_TYPES")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(JobType::from)
                    .collect()
            })
            .unwrap_or_default();

        let role = var("COLLECTQ_ROLE")
            .map(|v| v.parse::<Role>().map_err(|e| ConfigError::invalid("COLLECTQ_ROLE", &v, e)))
            .transpose()?
            .unwrap_or(d.role);

        let handler_timeout = var("COLLECTQ_HANDLER_TIMEOUT_SECS")
            .map(|v| parse_num::<u64>("COLLECTQ_HANDLER_TIMEOUT_SECS", &v))
            .transpose()?
            .map(Duration::from_secs);

        let cfg = Self {
            role,
            worker_type: var("COLLECTQ_WORKER_TYPE").unwrap_or(d.worker_type),
            worker_id,
            job_types,
            poll_interval: Duration::from_millis(num(
                &var,
                "COLLECTQ_POLL_INTERVAL_MS",
                d.poll_interval.as_millis() as u64,
            )?),
            heartbeat_interval: secs(
                &var,
                "COLLECTQ_HEARTBEAT_INTERVAL_SECS",
                d.heartbeat_interval,
            )?,
            lock_timeout: secs(&var, "COLLECTQ_LOCK_TIMEOUT_SECS", d.lock_timeout)?,
            sweep_interval: secs(&var, "COLLECTQ_SWEEP_INTERVAL_SECS", d.sweep_interval)?,
            reap_batch_size: num(&var, "COLLECTQ_REAP_BATCH_SIZE", d.reap_batch_size)?,
            liveness_window: secs(&var, "COLLECTQ_LIVENESS_WINDOW_SECS", d.liveness_window)?,
            default_max_attempts: num(&var, "COLLECTQ_MAX_ATTEMPTS", d.default_max_attempts)?,
            max_consecutive_failures: num(
                &var,
                "COLLECTQ_MAX_CONSECUTIVE_FAILURES",
                d.max_consecutive_failures,
            )?,
            shutdown_grace: secs(&var, "COLLECTQ_SHUTDOWN_GRACE_SECS", d.shutdown_grace)?,
            handler_timeout,
            db_max_connections: num(&var, "COLLECTQ_DB_MAX_CONNECTIONS", d.db_max_connections)?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("COLLECTQ_POLL_INTERVAL_MS", self.poll_interval.is_zero()),
            ("COLLECTQ_HEARTBEAT_INTERVAL_SECS", self.heartbeat_interval.is_zero()),
            ("COLLECTQ_LOCK_TIMEOUT_SECS", self.lock_timeout.is_zero()),
            ("COLLECTQ_SWEEP_INTERVAL_SECS", self.sweep_interval.is_zero()),
            ("COLLECTQ_LIVENESS_WINDOW_SECS", self.liveness_window.is_zero()),
            ("COLLECTQ_REAP_BATCH_SIZE", self.reap_batch_size == 0),
            ("COLLECTQ_MAX_CONSECUTIVE_FAILURES", self.max_consecutive_failures == 0),
            ("COLLECTQ_DB_MAX_CONNECTIONS", self.db_max_connections == 0),
        ];
        for (key, is_zero) in positive {
            if is_zero {
                return Err(ConfigError::invalid(key, "0", "must be greater than zero"));
            }
        }
        if self.heartbeat_interval >= self.liveness_window {
            return Err(ConfigError::invalid(
                "COLLECTQ_HEARTBEAT_INTERVAL_SECS",
                &self.heartbeat_interval.as_secs().to_string(),
                "must be shorter than COLLECTQ_LIVENESS_WINDOW_SECS",
            ));
        }
        if self.worker_type.chars().any(char::is_whitespace) {
            return Err(ConfigError::invalid(
                "COLLECTQ_WORKER_TYPE",
                &self.worker_type,
                "must not contain whitespace",
            ));
        }
        Ok(())
    }

    /// Worker settings; `host` seeds the generated worker id.
    pub fn worker_config(&self, host: &str) -> WorkerConfig {
        let worker_id = self
            .worker_id
            .clone()
            .unwrap_or_else(|| WorkerId::generate(&self.worker_type, host));

        let mut cfg = WorkerConfig::new(worker_id, self.worker_type.clone())
            .with_job_types(self.job_types.clone())
            .with_poll_interval(self.poll_interval)
            .with_heartbeat_interval(self.heartbeat_interval)
            .with_shutdown_grace(self.shutdown_grace)
            .with_max_consecutive_failures(self.max_consecutive_failures);
        if let Some(timeout) = self.handler_timeout {
            cfg = cfg.with_handler_timeout(timeout);
        }
        cfg
    }

    pub fn reaper_config(&self) -> ReaperConfig {
        ReaperConfig {
            lock_timeout: self.lock_timeout,
            sweep_interval: self.sweep_interval,
            batch_size: self.reap_batch_size,
            ..ReaperConfig::default()
        }
    }

    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            lock_timeout: self.lock_timeout,
            liveness_window: self.liveness_window,
        }
    }
}

impl ConnectionDescriptor {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let transport = match var("DB_TRANSPORT") {
            Some(v) => TransportMode::from_str(&v)
                .map_err(|e| ConfigError::invalid("DB_TRANSPORT", &v, e))?,
            None => TransportMode::Direct,
        };
        let default_port = match transport {
            TransportMode::Direct => 5432,
            TransportMode::Pooler => 6543,
        };
        let ssl_mode = match var("DB_SSLMODE") {
            Some(v) => SslMode::from_str(&v).map_err(|e| ConfigError::invalid("DB_SSLMODE", &v, e))?,
            None => SslMode::Require,
        };

        Ok(Self {
            transport,
            host: var("DB_HOST").unwrap_or_default(),
            port: num(&var, "DB_PORT", default_port)?,
            user: var("DB_USER").unwrap_or_default(),
            // Not trimmed: stray whitespace is a contract violation, not noise.
            password: lookup("DB_PASSWORD").unwrap_or_default(),
            database: var("DB_NAME").unwrap_or_default(),
            ssl_mode,
        })
    }
}

fn parse_num<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::invalid(key, raw, e))
}

fn num<T, V>(var: &V, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    V: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => parse_num(key, &raw),
        None => Ok(default),
    }
}

fn secs<V>(var: &V, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    V: Fn(&str) -> Option<String>,
{
    num(var, key, default.as_secs()).map(Duration::from_secs)
}
