//! Error types for the resilient query layer.
//!
//! Two levels of error exist:
//!
//! - [`DbError`] is what a driver adapter (or a caller's operation) reports for a
//!   single attempt. It carries a closed [`DbErrorKind`] so retry decisions never
//!   depend on parsing messages when the driver exposes structured information.
//! - [`QueryError`] is the single terminal outcome a caller of
//!   [`QueryExecutor::execute`](crate::executor::QueryExecutor::execute) receives.

use crate::database::error_codes::PgErrorCode;
use serde::Serialize;
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Closed classification of a driver-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DbErrorKind {
    /// Peer reset the connection (ECONNRESET, broken pipe)
    ConnectionReset,
    /// Server refused the connection (ECONNREFUSED, too many connections)
    ConnectionRefused,
    /// Connection dropped or unusable for another reason
    ConnectionLost,
    /// DNS failure or unreachable host
    HostUnreachable,
    /// Network or statement timeout
    Timeout,
    /// Serialization failure or deadlock; the transaction can be replayed
    SerializationFailure,
    /// Integrity constraint violation (unique, foreign key, not null, check)
    ConstraintViolation,
    /// SQL syntax or access rule violation
    Syntax,
    /// Error raised by the caller's own logic
    Business,
    /// Anything the adapter could not classify
    Other,
}

impl DbErrorKind {
    /// Whether a failure of this kind is expected to go away on retry.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            DbErrorKind::ConnectionReset
                | DbErrorKind::ConnectionRefused
                | DbErrorKind::ConnectionLost
                | DbErrorKind::HostUnreachable
                | DbErrorKind::Timeout
                | DbErrorKind::SerializationFailure
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DbErrorKind::ConnectionReset => "connection_reset",
            DbErrorKind::ConnectionRefused => "connection_refused",
            DbErrorKind::ConnectionLost => "connection_lost",
            DbErrorKind::HostUnreachable => "host_unreachable",
            DbErrorKind::Timeout => "timeout",
            DbErrorKind::SerializationFailure => "serialization_failure",
            DbErrorKind::ConstraintViolation => "constraint_violation",
            DbErrorKind::Syntax => "syntax",
            DbErrorKind::Business => "business",
            DbErrorKind::Other => "other",
        }
    }
}

impl fmt::Display for DbErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single failed database interaction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct DbError {
    kind: DbErrorKind,
    code: Option<String>,
    message: String,
}

impl DbError {
    pub fn new(kind: DbErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
        }
    }

    /// Attach a driver error code (SQLSTATE for PostgreSQL).
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// A terminal error raised by caller logic. Never retried.
    pub fn business(message: impl Into<String>) -> Self {
        Self::new(DbErrorKind::Business, message)
    }

    /// Classify an error from its message alone.
    ///
    /// Fallback for drivers that do not expose structured codes. Substring
    /// matching is fragile: an unrelated error whose text mentions "connection"
    /// or "timeout" is classified as transient and retried.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = classify_message(&message);
        Self::new(kind, message)
    }

    /// Classify a database-reported error by its SQLSTATE code.
    pub fn from_sqlstate(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = PgErrorCode::classify(code).unwrap_or_else(|| classify_message(&message));
        Self::new(kind, message).with_code(code)
    }

    pub fn kind(&self) -> DbErrorKind {
        self.kind
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    #[inline]
    pub fn is_retryable(&self) -> bool {
        self.kind.is_transient()
    }
}

fn classify_message(message: &str) -> DbErrorKind {
    let lower = message.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&["econnreset", "connection reset", "broken pipe"]) {
        DbErrorKind::ConnectionReset
    } else if has(&["econnrefused", "connection refused"]) {
        DbErrorKind::ConnectionRefused
    } else if has(&[
        "enotfound",
        "eai_again",
        "ehostunreach",
        "enetunreach",
        "host unreachable",
        "network is unreachable",
        "no route to host",
        "failed to lookup address",
        "name resolution",
    ]) {
        DbErrorKind::HostUnreachable
    } else if has(&["etimedout", "timeout", "timed out"]) {
        DbErrorKind::Timeout
    } else if lower.contains("connection") {
        DbErrorKind::ConnectionLost
    } else {
        DbErrorKind::Other
    }
}

impl From<io::Error> for DbError {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => DbErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionRefused => DbErrorKind::ConnectionRefused,
            io::ErrorKind::NotConnected | io::ErrorKind::UnexpectedEof => {
                DbErrorKind::ConnectionLost
            }
            io::ErrorKind::TimedOut => DbErrorKind::Timeout,
            _ => return DbError::from_message(err.to_string()),
        };
        DbError::new(kind, err.to_string())
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => match db_err.code() {
                Some(code) => DbError::from_sqlstate(&code, db_err.message()),
                None => DbError::from_message(db_err.message()),
            },
            sqlx::Error::Io(io_err) => DbError::from(io_err),
            sqlx::Error::PoolTimedOut => {
                DbError::new(DbErrorKind::Timeout, "timed out waiting for a connection")
            }
            sqlx::Error::WorkerCrashed => {
                DbError::new(DbErrorKind::ConnectionLost, "connection worker crashed")
            }
            sqlx::Error::RowNotFound => DbError::new(DbErrorKind::Business, "no rows returned"),
            sqlx::Error::Configuration(e) => DbError::new(DbErrorKind::Other, e.to_string()),
            other => DbError::from_message(other.to_string()),
        }
    }
}

/// Failures raised by the connection pool itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("no connection became available within {timeout:?}")]
    Exhausted { timeout: Duration },
    #[error("connection pool is closed")]
    Closed,
    #[error("failed to open connection: {0}")]
    Connect(DbError),
}

/// Terminal outcome of a query execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("Connection pool exhausted: no connection available within {timeout:?}")]
    PoolExhausted { timeout: Duration },
    #[error("Transient connection failure in '{query}' after {attempts} attempt(s): {source}")]
    TransientConnection {
        query: String,
        attempts: u32,
        #[source]
        source: DbError,
    },
    #[error("Query '{query}' failed: {source}")]
    TerminalQuery {
        query: String,
        #[source]
        source: DbError,
    },
    #[error("Shutdown in progress: connection pool no longer accepts work")]
    ShutdownInProgress,
    #[error("Query '{query}' cancelled: {reason}")]
    Cancelled { query: String, reason: String },
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl QueryError {
    /// The underlying driver error, when the failure came from the database.
    pub fn db_error(&self) -> Option<&DbError> {
        match self {
            QueryError::TransientConnection { source, .. }
            | QueryError::TerminalQuery { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<crate::config::ConfigurationError> for QueryError {
    fn from(err: crate::config::ConfigurationError) -> Self {
        QueryError::Configuration(err.to_string())
    }
}

pub type QueryResult<T> = Result<T, QueryError>;
