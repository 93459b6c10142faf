//! Connection failure classification.
//!
//! The driver reports authentication rejections, lockouts, network blips and
//! misconfiguration through the same error type. Retrying them the same way is
//! what turns a bad password into an account lockout, so every failure is
//! sorted into a [`FailureClass`] before any retry decision is made.

use serde::Serialize;

/// Classification of a failed connection (or store) operation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Credentials rejected or the account is locked out.
    AuthFailure,
    /// Timeouts, refused/reset connections, server restarts.
    TransientNetwork,
    /// The descriptor itself is wrong; retrying cannot help.
    ConfigViolation,
    /// Nothing matched.
    Unknown,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::AuthFailure => "auth_failure",
            FailureClass::TransientNetwork => "transient_network",
            FailureClass::ConfigViolation => "config_violation",
            FailureClass::Unknown => "unknown",
        }
    }

    /// Exit code when a failure of this class ends the process: 78
    /// (`EX_CONFIG`) for configuration, 2 for rejected credentials, 1
    /// otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            FailureClass::AuthFailure => 2,
            FailureClass::ConfigViolation => 78,
            FailureClass::TransientNetwork | FailureClass::Unknown => 1,
        }
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed connection attempt as reported by a [`Connector`](super::Connector).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{class}: {message}")]
pub struct ConnectFailure {
    pub class: FailureClass,
    pub message: String,
}

impl ConnectFailure {
    pub fn new(class: FailureClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    /// Build a failure from a driver message, classifying it by signature.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            class: classify_message(&message),
            message,
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(FailureClass::AuthFailure, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureClass::TransientNetwork, message)
    }
}

/// Classify a failure already reported by a connector.
pub fn classify(failure: &ConnectFailure) -> FailureClass {
    failure.class
}

// SQLSTATE codes. Class 28 is "invalid authorization specification".
const AUTH_SQLSTATES: &[&str] = &["28P01", "28000"];
const TRANSIENT_SQLSTATES: &[&str] = &["57P01", "57P02", "57P03", "53300", "40001", "40P01"];

const AUTH_SIGNATURES: &[&str] = &[
    "password authentication failed",
    "authentication failed",
    "too many authentication",
    "circuit breaker open",
    "account locked",
    "account is locked",
    "invalid password",
    "no pg_hba.conf entry",
];

const TRANSIENT_SIGNATURES: &[&str] = &[
    "timed out",
    "timeout",
    "connection refused",
    "connection reset",
    "broken pipe",
    "network is unreachable",
    "temporary failure in name resolution",
    "the database system is starting up",
    "the database system is shutting down",
    "too many connections",
    "remaining connection slots are reserved",
];

const CONFIG_SIGNATURES: &[&str] = &[
    "server does not support tls",
    "sslmode",
    "invalid connection string",
    "invalid port",
];

/// Classify a free-form driver message by its signature.
///
/// Auth signatures win over everything else: a lockout message that also
/// mentions a timeout must never be retried on the transient budget.
pub fn classify_message(message: &str) -> FailureClass {
    let lower = message.to_ascii_lowercase();

    if AUTH_SIGNATURES.iter().any(|s| lower.contains(s)) || is_missing_role(&lower) {
        return FailureClass::AuthFailure;
    }
    if CONFIG_SIGNATURES.iter().any(|s| lower.contains(s)) {
        return FailureClass::ConfigViolation;
    }
    if TRANSIENT_SIGNATURES.iter().any(|s| lower.contains(s)) {
        return FailureClass::TransientNetwork;
    }
    FailureClass::Unknown
}

fn is_missing_role(lower: &str) -> bool {
    lower.contains("role \"") && lower.contains("does not exist")
}

/// Classify a SQLSTATE code, if it carries a known meaning.
pub fn classify_sqlstate(code: &str) -> Option<FailureClass> {
    if AUTH_SQLSTATES.contains(&code) {
        Some(FailureClass::AuthFailure)
    } else if code.starts_with("08") || TRANSIENT_SQLSTATES.contains(&code) {
        Some(FailureClass::TransientNetwork)
    } else {
        None
    }
}

/// Classify an error returned by sqlx.
pub fn classify_sqlx_error(err: &sqlx::Error) -> FailureClass {
    match err {
        sqlx::Error::Database(db_err) => db_err
            .code()
            .and_then(|code| classify_sqlstate(code.as_ref()))
            .unwrap_or_else(|| classify_message(db_err.message())),
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            FailureClass::TransientNetwork
        }
        sqlx::Error::WorkerCrashed => FailureClass::TransientNetwork,
        sqlx::Error::Configuration(_) => FailureClass::ConfigViolation,
        sqlx::Error::Tls(e) => match classify_message(&e.to_string()) {
            FailureClass::Unknown => FailureClass::ConfigViolation,
            other => other,
        },
        other => classify_message(&other.to_string()),
    }
}

impl From<&sqlx::Error> for ConnectFailure {
    fn from(err: &sqlx::Error) -> Self {
        ConnectFailure::new(classify_sqlx_error(err), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_signatures() {
        for msg in [
            "FATAL: password authentication failed for user \"svc\"",
            "Circuit breaker open: Too many authentication errors",
            "FATAL: role \"collector\" does not exist",
            "no pg_hba.conf entry for host \"10.0.0.1\"",
        ] {
            assert_eq!(classify_message(msg), FailureClass::AuthFailure, "{msg}");
        }
    }

    #[test]
    fn auth_wins_over_timeout_wording() {
        assert_eq!(
            classify_message("authentication failed: lockout timeout not yet expired"),
            FailureClass::AuthFailure
        );
    }

    #[test]
    fn transient_signatures() {
        for msg in [
            "connection refused (os error 111)",
            "pool timed out while waiting for an open connection",
            "FATAL: the database system is starting up",
        ] {
            assert_eq!(classify_message(msg), FailureClass::TransientNetwork, "{msg}");
        }
    }

    #[test]
    fn config_and_unknown() {
        assert_eq!(
            classify_message("error: server does not support TLS"),
            FailureClass::ConfigViolation
        );
        assert_eq!(classify_message("something odd"), FailureClass::Unknown);
    }

    #[test]
    fn sqlstate_codes() {
        assert_eq!(classify_sqlstate("28P01"), Some(FailureClass::AuthFailure));
        assert_eq!(classify_sqlstate("08006"), Some(FailureClass::TransientNetwork));
        assert_eq!(classify_sqlstate("57P01"), Some(FailureClass::TransientNetwork));
        assert_eq!(classify_sqlstate("23505"), None);
    }

    #[test]
    fn sqlx_variants() {
        assert_eq!(
            classify_sqlx_error(&sqlx::Error::PoolTimedOut),
            FailureClass::TransientNetwork
        );
        let io = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert_eq!(classify_sqlx_error(&io), FailureClass::TransientNetwork);
        assert_eq!(
            classify_sqlx_error(&sqlx::Error::Configuration("bad port".into())),
            FailureClass::ConfigViolation
        );
        assert_eq!(
            classify_sqlx_error(&sqlx::Error::RowNotFound),
            FailureClass::Unknown
        );
    }
}
