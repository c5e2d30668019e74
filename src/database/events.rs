//! Pool lifecycle events and observer registration.

use crate::error::DbError;
use std::time::Duration;

/// Why a physical connection left the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveReason {
    /// Sat idle longer than `idle_timeout_ms`
    IdleTimeout,
    /// Failed the manager's validity check
    Invalid,
    /// Returned in an unknown state (open transaction, cancelled mid-query)
    Discarded,
    /// Pool is closing
    Shutdown,
}

/// Something that happened to the pool
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
    /// A new physical connection was opened and guarded
    Connect,
    /// A connection was handed to a borrower
    Acquire { wait: Duration },
    /// A borrower gave its connection back
    Release,
    /// A physical connection was closed
    Remove { reason: RemoveReason },
    /// No connection became available within the connection timeout
    AcquireTimeout { waited: Duration },
    /// Acquire attempted after close
    Rejected,
    /// Opening or preparing a connection failed
    Error { error: DbError },
}

/// Observer registered at pool construction.
///
/// Called synchronously from the pool's hot paths, including `Drop`; keep
/// implementations non-blocking.
pub trait PoolEventListener: Send + Sync {
    fn on_event(&self, event: &PoolEvent);
}
