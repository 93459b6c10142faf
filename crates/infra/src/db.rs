//! Database wiring: schema migrations and shared sqlx error mapping.

use sqlx::PgPool;
use tracing::info;

use crate::connection::{FailureClass, classify_sqlx_error};

const SCHEMA: &str = include_str!("../migrations/0001_jobs.sql");

/// Create the `jobs` and `worker_heartbeats` tables if they do not exist.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    info!("schema up to date");
    Ok(())
}

/// How a sqlx error should be surfaced by a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SqlFault {
    /// Connectivity problem; callers may retry under the class's policy.
    Unavailable { class: FailureClass, message: String },
    /// Anything else (constraint violations, decode errors, ...).
    Storage(String),
}

pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> SqlFault {
    let class = classify_sqlx_error(&err);
    let message = format!("{operation}: {err}");
    match class {
        FailureClass::AuthFailure | FailureClass::TransientNetwork => {
            SqlFault::Unavailable { class, message }
        }
        FailureClass::ConfigViolation | FailureClass::Unknown => SqlFault::Storage(message),
    }
}
