//! PostgreSQL Error Codes
//!
//! Constants for the PostgreSQL SQLSTATE codes that drive retry classification.
//!
//! ## SQLSTATE Format
//!
//! PostgreSQL error codes follow the SQL standard SQLSTATE format:
//! - 5-character codes representing error classes and conditions
//! - First 2 characters: error class
//! - Last 3 characters: specific condition
//!
//! ## Reference
//!
//! Full list: <https://www.postgresql.org/docs/current/errcodes-appendix.html>

use crate::error::DbErrorKind;

/// PostgreSQL SQLSTATE error codes
///
/// Only codes that influence classification are included; add more as needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PgErrorCode;

impl PgErrorCode {
    // =========================================================================
    // Class 08 — Connection Exception
    // =========================================================================

    /// Connection exception (generic) - Code 08000
    pub const CONNECTION_EXCEPTION: &'static str = "08000";

    /// Connection does not exist - Code 08003
    pub const CONNECTION_DOES_NOT_EXIST: &'static str = "08003";

    /// Connection failure - Code 08006
    pub const CONNECTION_FAILURE: &'static str = "08006";

    /// SQL client unable to establish connection - Code 08001
    pub const SQLCLIENT_UNABLE_TO_ESTABLISH_SQLCONNECTION: &'static str = "08001";

    /// Server rejected the connection - Code 08004
    pub const SQLSERVER_REJECTED_ESTABLISHMENT_OF_SQLCONNECTION: &'static str = "08004";

    // =========================================================================
    // Class 23 — Integrity Constraint Violation
    // =========================================================================

    /// Unique violation (duplicate key) - Code 23505
    pub const UNIQUE_VIOLATION: &'static str = "23505";

    /// Foreign key violation - Code 23503
    pub const FOREIGN_KEY_VIOLATION: &'static str = "23503";

    /// Not null violation - Code 23502
    pub const NOT_NULL_VIOLATION: &'static str = "23502";

    // =========================================================================
    // Class 40 — Transaction Rollback
    // =========================================================================

    /// Serialization failure - Code 40001
    ///
    /// Occurs in SERIALIZABLE isolation level when a transaction cannot be
    /// serialized with concurrent transactions. Should be retried.
    pub const SERIALIZATION_FAILURE: &'static str = "40001";

    /// Deadlock detected - Code 40P01
    pub const DEADLOCK_DETECTED: &'static str = "40P01";

    // =========================================================================
    // Class 42 — Syntax Error or Access Rule Violation
    // =========================================================================

    /// Syntax error - Code 42601
    pub const SYNTAX_ERROR: &'static str = "42601";

    // =========================================================================
    // Class 53 — Insufficient Resources
    // =========================================================================

    /// Too many connections - Code 53300
    ///
    /// The server hit `max_connections`; another attempt may find a free slot.
    pub const TOO_MANY_CONNECTIONS: &'static str = "53300";

    // =========================================================================
    // Class 55 / 57 — Object State and Operator Intervention
    // =========================================================================

    /// Lock not available - Code 55P03
    ///
    /// Raised when `lock_timeout` elapses.
    pub const LOCK_NOT_AVAILABLE: &'static str = "55P03";

    /// Query canceled - Code 57014
    ///
    /// Raised when `statement_timeout` elapses or a cancel request arrives.
    pub const QUERY_CANCELED: &'static str = "57014";

    /// Admin shutdown - Code 57P01
    pub const ADMIN_SHUTDOWN: &'static str = "57P01";

    /// Crash shutdown - Code 57P02
    pub const CRASH_SHUTDOWN: &'static str = "57P02";

    /// Cannot connect now (server starting up) - Code 57P03
    pub const CANNOT_CONNECT_NOW: &'static str = "57P03";

    /// Idle-in-transaction session timeout - Code 25P03
    pub const IDLE_IN_TRANSACTION_SESSION_TIMEOUT: &'static str = "25P03";

    // =========================================================================
    // Helper Methods
    // =========================================================================

    /// Check if the error code is a unique constraint violation
    #[inline]
    pub fn is_unique_violation(code: &str) -> bool {
        code == Self::UNIQUE_VIOLATION
    }

    /// Check if the error code is any integrity constraint violation (Class 23)
    #[inline]
    pub fn is_integrity_constraint_violation(code: &str) -> bool {
        code.starts_with("23")
    }

    /// Check if the error is retryable (serialization failure or deadlock)
    #[inline]
    pub fn is_retryable_transaction_error(code: &str) -> bool {
        code == Self::SERIALIZATION_FAILURE || code == Self::DEADLOCK_DETECTED
    }

    /// Check if the error code belongs to the connection exception class (Class 08)
    #[inline]
    pub fn is_connection_exception(code: &str) -> bool {
        code.starts_with("08")
    }

    /// Map a SQLSTATE code to an error kind.
    ///
    /// Returns `None` for codes with no specific meaning to the retry policy so
    /// the caller can fall back to message inspection.
    pub fn classify(code: &str) -> Option<DbErrorKind> {
        let kind = match code {
            Self::SQLCLIENT_UNABLE_TO_ESTABLISH_SQLCONNECTION
            | Self::SQLSERVER_REJECTED_ESTABLISHMENT_OF_SQLCONNECTION
            | Self::TOO_MANY_CONNECTIONS
            | Self::CANNOT_CONNECT_NOW => DbErrorKind::ConnectionRefused,
            Self::ADMIN_SHUTDOWN | Self::CRASH_SHUTDOWN => DbErrorKind::ConnectionLost,
            Self::QUERY_CANCELED
            | Self::LOCK_NOT_AVAILABLE
            | Self::IDLE_IN_TRANSACTION_SESSION_TIMEOUT => DbErrorKind::Timeout,
            c if Self::is_retryable_transaction_error(c) => DbErrorKind::SerializationFailure,
            c if Self::is_connection_exception(c) => DbErrorKind::ConnectionLost,
            c if Self::is_integrity_constraint_violation(c) => DbErrorKind::ConstraintViolation,
            c if c.starts_with("42") => DbErrorKind::Syntax,
            _ => return None,
        };
        Some(kind)
    }
}
