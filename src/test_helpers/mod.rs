//! # Test Helpers
//!
//! In-memory [`ConnectionManager`] and event recorder for exercising the pool
//! and executor without a database. Used by unit tests and by the integration
//! tests under `tests/`.

use crate::config::{HealthConfig, PoolConfig, ResilientDbConfig, RetryConfig, ShutdownConfig};
use crate::database::{ConnectionManager, PoolEvent, PoolEventListener, SessionGuards};
use crate::error::DbError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Connection handed out by [`MockConnectionManager`]
#[derive(Debug)]
pub struct MockConnection {
    pub id: u64,
    /// Guards applied when the connection was opened
    pub guards: Option<SessionGuards>,
    pub in_transaction: bool,
}

/// Call counts observed by the mock
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockStats {
    pub connects: u64,
    pub closes: u64,
    pub begins: u64,
    pub commits: u64,
    pub rollbacks: u64,
    pub pings: u64,
}

#[derive(Debug, Default)]
struct MockState {
    next_id: AtomicU64,
    connects: AtomicU64,
    closes: AtomicU64,
    begins: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    pings: AtomicU64,
    connect_failures: Mutex<VecDeque<DbError>>,
    ping_failure: Mutex<Option<DbError>>,
    commit_failure: Mutex<Option<DbError>>,
    connect_delay: Mutex<Duration>,
    ping_delay: Mutex<Duration>,
}

/// Scriptable in-memory connection manager. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockConnectionManager {
    state: Arc<MockState>,
}

impl MockConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `connect()` calls with these errors, in order.
    pub fn fail_next_connects(&self, errors: Vec<DbError>) {
        self.state.connect_failures.lock().extend(errors);
    }

    pub fn set_ping_failure(&self, error: Option<DbError>) {
        *self.state.ping_failure.lock() = error;
    }

    pub fn set_commit_failure(&self, error: Option<DbError>) {
        *self.state.commit_failure.lock() = error;
    }

    /// Delay every `connect()` by `delay` before it succeeds or fails.
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.state.connect_delay.lock() = delay;
    }

    pub fn set_ping_delay(&self, delay: Duration) {
        *self.state.ping_delay.lock() = delay;
    }

    pub fn stats(&self) -> MockStats {
        let s = &self.state;
        MockStats {
            connects: s.connects.load(Ordering::SeqCst),
            closes: s.closes.load(Ordering::SeqCst),
            begins: s.begins.load(Ordering::SeqCst),
            commits: s.commits.load(Ordering::SeqCst),
            rollbacks: s.rollbacks.load(Ordering::SeqCst),
            pings: s.pings.load(Ordering::SeqCst),
        }
    }
}

#[async_trait]
impl ConnectionManager for MockConnectionManager {
    type Connection = MockConnection;

    async fn connect(&self) -> Result<MockConnection, DbError> {
        let delay = *self.state.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.state.connect_failures.lock().pop_front() {
            return Err(error);
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(MockConnection {
            id: self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            guards: None,
            in_transaction: false,
        })
    }

    async fn apply_session_guards(
        &self,
        conn: &mut MockConnection,
        guards: &SessionGuards,
    ) -> Result<(), DbError> {
        conn.guards = Some(*guards);
        Ok(())
    }

    async fn begin(&self, conn: &mut MockConnection) -> Result<(), DbError> {
        self.state.begins.fetch_add(1, Ordering::SeqCst);
        conn.in_transaction = true;
        Ok(())
    }

    async fn commit(&self, conn: &mut MockConnection) -> Result<(), DbError> {
        if let Some(error) = self.state.commit_failure.lock().clone() {
            return Err(error);
        }
        self.state.commits.fetch_add(1, Ordering::SeqCst);
        conn.in_transaction = false;
        Ok(())
    }

    async fn rollback(&self, conn: &mut MockConnection) -> Result<(), DbError> {
        self.state.rollbacks.fetch_add(1, Ordering::SeqCst);
        conn.in_transaction = false;
        Ok(())
    }

    async fn ping(&self, _conn: &mut MockConnection) -> Result<(), DbError> {
        self.state.pings.fetch_add(1, Ordering::SeqCst);
        let delay = *self.state.ping_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match self.state.ping_failure.lock().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn close(&self, _conn: MockConnection) {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn describe(&self) -> String {
        "mock://test".to_string()
    }
}

/// Pool listener that keeps every event it sees
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<PoolEvent>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<PoolEvent> {
        self.events.lock().clone()
    }
}

impl PoolEventListener for RecordingListener {
    fn on_event(&self, event: &PoolEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Configuration with short timeouts and a 10ms backoff base.
pub fn test_config() -> ResilientDbConfig {
    ResilientDbConfig {
        pool: PoolConfig {
            max_connections: 4,
            idle_timeout_ms: 30_000,
            connection_timeout_ms: 200,
            query_timeout_ms: 1_000,
            retry_attempts: 3,
        },
        retry: RetryConfig {
            base_delay_ms: 10,
            max_delay_ms: 100,
        },
        health: HealthConfig::default(),
        shutdown: ShutdownConfig {
            drain_timeout_ms: 500,
        },
    }
}
