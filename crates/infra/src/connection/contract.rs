//! Connection descriptor and its static pre-flight contract.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use collectq_core::DomainError;

/// How the process reaches Postgres.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// Straight to the database server.
    Direct,
    /// Through a transaction-mode connection pooler.
    Pooler,
}

impl FromStr for TransportMode {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(TransportMode::Direct),
            "pooler" | "pooled" => Ok(TransportMode::Pooler),
            other => Err(DomainError::validation(format!(
                "unknown transport mode '{other}'"
            ))),
        }
    }
}

/// Encryption setting, named after libpq's `sslmode`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    Disable,
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    /// Whether the mode refuses to fall back to plaintext.
    pub fn is_encrypted(&self) -> bool {
        matches!(self, SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull)
    }
}

impl FromStr for SslMode {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disable" => Ok(SslMode::Disable),
            "prefer" => Ok(SslMode::Prefer),
            "require" => Ok(SslMode::Require),
            "verify-ca" => Ok(SslMode::VerifyCa),
            "verify-full" => Ok(SslMode::VerifyFull),
            other => Err(DomainError::validation(format!("unknown sslmode '{other}'"))),
        }
    }
}

/// The single connection descriptor the process is configured with.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub transport: TransportMode,
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub database: String,
    pub ssl_mode: SslMode,
}

// Hand-written so the password never reaches a log line.
impl std::fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("transport", &self.transport)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// A single way a descriptor breaks the contract.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContractViolation {
    #[error("encryption required but sslmode is {0:?}")]
    EncryptionRequired(SslMode),
    #[error("{transport:?} transport must use port {expected}, got {actual}")]
    PortMismatch {
        transport: TransportMode,
        expected: u16,
        actual: u16,
    },
    #[error("host is empty")]
    EmptyHost,
    #[error("database name is empty")]
    EmptyDatabase,
    #[error("user is empty")]
    EmptyUser,
    #[error("password is empty")]
    EmptyPassword,
    #[error("password contains whitespace (likely a quoting mistake)")]
    PasswordWhitespace,
    #[error("pooler user '{0}' must be qualified as <role>.<tenant>")]
    UnqualifiedPoolerUser(String),
}

/// Static rules a descriptor must satisfy before any network attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionContract {
    pub require_encryption: bool,
    pub direct_port: u16,
    pub pooler_port: u16,
    /// Poolers route by tenant, so their user names carry a `.tenant` suffix.
    pub require_qualified_pooler_user: bool,
}

impl Default for ConnectionContract {
    fn default() -> Self {
        Self {
            require_encryption: true,
            direct_port: 5432,
            pooler_port: 6543,
            require_qualified_pooler_user: true,
        }
    }
}

impl ConnectionContract {
    /// Check a descriptor. Returns every violation found, not just the first.
    pub fn validate(&self, d: &ConnectionDescriptor) -> Result<(), Vec<ContractViolation>> {
        let mut violations = Vec::new();

        if d.host.trim().is_empty() {
            violations.push(ContractViolation::EmptyHost);
        }
        if d.database.trim().is_empty() {
            violations.push(ContractViolation::EmptyDatabase);
        }

        let expected_port = match d.transport {
            TransportMode::Direct => self.direct_port,
            TransportMode::Pooler => self.pooler_port,
        };
        if d.port != expected_port {
            violations.push(ContractViolation::PortMismatch {
                transport: d.transport,
                expected: expected_port,
                actual: d.port,
            });
        }

        if self.require_encryption && !d.ssl_mode.is_encrypted() {
            violations.push(ContractViolation::EncryptionRequired(d.ssl_mode));
        }

        if d.user.trim().is_empty() {
            violations.push(ContractViolation::EmptyUser);
        } else if self.require_qualified_pooler_user
            && d.transport == TransportMode::Pooler
            && !is_qualified(&d.user)
        {
            violations.push(ContractViolation::UnqualifiedPoolerUser(d.user.clone()));
        }

        if d.password.is_empty() {
            violations.push(ContractViolation::EmptyPassword);
        } else if d.password.chars().any(char::is_whitespace) {
            violations.push(ContractViolation::PasswordWhitespace);
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }
}

fn is_qualified(user: &str) -> bool {
    match user.split_once('.') {
        Some((role, tenant)) => !role.is_empty() && !tenant.is_empty(),
        None => false,
    }
}

#[cfg(test)]
pub(crate) fn test_descriptor() -> ConnectionDescriptor {
    ConnectionDescriptor {
        transport: TransportMode::Direct,
        host: "db.internal".to_string(),
        port: 5432,
        user: "collectq".to_string(),
        password: "s3cret".to_string(),
        database: "collections".to_string(),
        ssl_mode: SslMode::Require,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_direct_descriptor_passes() {
        ConnectionContract::default()
            .validate(&test_descriptor())
            .unwrap();
    }

    #[test]
    fn missing_encryption_is_rejected() {
        let mut d = test_descriptor();
        d.ssl_mode = SslMode::Prefer;
        let err = ConnectionContract::default().validate(&d).unwrap_err();
        assert_eq!(err, vec![ContractViolation::EncryptionRequired(SslMode::Prefer)]);
    }

    #[test]
    fn pooler_needs_its_port_and_a_qualified_user() {
        let mut d = test_descriptor();
        d.transport = TransportMode::Pooler;
        let err = ConnectionContract::default().validate(&d).unwrap_err();
        assert!(err.contains(&ContractViolation::PortMismatch {
            transport: TransportMode::Pooler,
            expected: 6543,
            actual: 5432,
        }));
        assert!(err.contains(&ContractViolation::UnqualifiedPoolerUser("collectq".into())));

        d.port = 6543;
        d.user = "collectq.tenant01".into();
        ConnectionContract::default().validate(&d).unwrap();
    }

    #[test]
    fn credential_shape() {
        let mut d = test_descriptor();
        d.password = "pass word".into();
        d.user = " ".into();
        let err = ConnectionContract::default().validate(&d).unwrap_err();
        assert!(err.contains(&ContractViolation::EmptyUser));
        assert!(err.contains(&ContractViolation::PasswordWhitespace));
    }

    #[test]
    fn debug_redacts_password() {
        let rendered = format!("{:?}", test_descriptor());
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn parse_modes() {
        assert_eq!("Pooler".parse::<TransportMode>().unwrap(), TransportMode::Pooler);
        assert_eq!("verify-full".parse::<SslMode>().unwrap(), SslMode::VerifyFull);
        assert!("tls".parse::<SslMode>().is_err());
    }
}
