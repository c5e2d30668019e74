//! Driver seam between the pool and a concrete database client.

use crate::error::DbError;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

/// Session-level limits applied to every new physical connection.
///
/// These bound how long a single connection can be held by a runaway
/// statement, an idle open transaction, or a lock wait, independent of the
/// executor's own retry and deadline handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionGuards {
    pub statement_timeout: Duration,
    pub idle_in_transaction_timeout: Duration,
    pub lock_timeout: Duration,
}

impl SessionGuards {
    /// Derive guards from the query timeout: statement = q, idle-in-transaction = 2q,
    /// lock = q/3. Each value is at least 1ms since 0 disables the limit in PostgreSQL.
    pub fn from_query_timeout(query_timeout: Duration) -> Self {
        let floor = Duration::from_millis(1);
        Self {
            statement_timeout: query_timeout.max(floor),
            idle_in_transaction_timeout: query_timeout.saturating_mul(2).max(floor),
            lock_timeout: (query_timeout / 3).max(floor),
        }
    }

    /// `SET` statements applying these guards to a PostgreSQL session.
    pub fn statements(&self) -> [String; 3] {
        [
            format!(
                "SET statement_timeout = {}",
                self.statement_timeout.as_millis()
            ),
            format!(
                "SET idle_in_transaction_session_timeout = {}",
                self.idle_in_transaction_timeout.as_millis()
            ),
            format!("SET lock_timeout = {}", self.lock_timeout.as_millis()),
        ]
    }
}

/// Creates, checks and tears down physical connections for a [`ConnectionPool`].
///
/// Implementations translate driver failures into [`DbError`] so that the
/// executor can decide on retries from a closed set of kinds.
///
/// [`ConnectionPool`]: crate::database::ConnectionPool
#[async_trait]
pub trait ConnectionManager: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Open a new physical connection.
    async fn connect(&self) -> Result<Self::Connection, DbError>;

    /// Apply session limits to a freshly opened connection.
    async fn apply_session_guards(
        &self,
        conn: &mut Self::Connection,
        guards: &SessionGuards,
    ) -> Result<(), DbError>;

    async fn begin(&self, conn: &mut Self::Connection) -> Result<(), DbError>;

    async fn commit(&self, conn: &mut Self::Connection) -> Result<(), DbError>;

    async fn rollback(&self, conn: &mut Self::Connection) -> Result<(), DbError>;

    /// Cheap round trip used by health checks.
    async fn ping(&self, conn: &mut Self::Connection) -> Result<(), DbError>;

    /// Synchronous validity check run when a connection is returned or reused.
    fn is_valid(&self, _conn: &Self::Connection) -> bool {
        true
    }

    /// Gracefully close a connection. Errors are logged by the implementation.
    async fn close(&self, conn: Self::Connection);

    /// Human readable connection target with credentials removed.
    fn describe(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guards_derived_from_query_timeout() {
        let guards = SessionGuards::from_query_timeout(Duration::from_millis(30_000));
        assert_eq!(guards.statement_timeout, Duration::from_millis(30_000));
        assert_eq!(guards.idle_in_transaction_timeout, Duration::from_millis(60_000));
        assert_eq!(guards.lock_timeout, Duration::from_millis(10_000));
    }

    #[test]
    fn test_guards_never_zero() {
        let guards = SessionGuards::from_query_timeout(Duration::from_millis(1));
        assert_eq!(guards.lock_timeout, Duration::from_millis(1));
        assert_eq!(
            guards.statements()[2],
            "SET lock_timeout = 1".to_string()
        );
    }

    #[test]
    fn test_guard_statements() {
        let guards = SessionGuards::from_query_timeout(Duration::from_millis(3000));
        assert_eq!(
            guards.statements(),
            [
                "SET statement_timeout = 3000".to_string(),
                "SET idle_in_transaction_session_timeout = 6000".to_string(),
                "SET lock_timeout = 1000".to_string(),
            ]
        );
    }
}
