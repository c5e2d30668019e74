//! # Connection Pool
//!
//! Bounded pool of physical connections with scoped borrowing.
//!
//! - At most `max_connections` connections are borrowed at once; a semaphore
//!   permit travels with every [`PooledConnection`].
//! - [`ConnectionPool::acquire`] is the only suspending wait and gives up with
//!   [`PoolError::Exhausted`] after `connection_timeout_ms`.
//! - Every new physical connection gets [`SessionGuards`] before first use.
//! - Dropping a [`PooledConnection`] returns it, on every exit path. Connections
//!   returned mid-transaction or marked broken are closed instead of reused.
//! - [`ConnectionPool::close`] rejects new acquires, drains borrowed
//!   connections for a bounded time and closes everything idle.

use crate::config::{ConfigResult, PoolConfig};
use crate::database::acquire_stats::{AcquireStats, AcquireStatsSnapshot};
use crate::database::events::{PoolEvent, PoolEventListener, RemoveReason};
use crate::database::manager::{ConnectionManager, SessionGuards};
use crate::error::{DbError, DbErrorKind, PoolError};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Point-in-time pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// Physical connections alive (idle + borrowed)
    pub total_count: u32,
    pub idle_count: u32,
    /// Callers suspended in `acquire()`
    pub waiting_count: u32,
    pub max_connections: u32,
    pub is_closed: bool,
}

impl PoolStatus {
    pub fn borrowed_count(&self) -> u32 {
        self.total_count.saturating_sub(self.idle_count)
    }

    pub fn utilization_percentage(&self) -> f64 {
        if self.max_connections == 0 {
            0.0
        } else {
            (self.borrowed_count() as f64 / self.max_connections as f64) * 100.0
        }
    }
}

/// Result of closing the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every borrowed connection came back within the drain timeout
    Drained { closed_idle: usize },
    /// Some borrowers still held connections when the drain timeout elapsed;
    /// those connections are closed as soon as they are returned
    TimedOut { outstanding: u32, closed_idle: usize },
    /// `close()` had already been called
    AlreadyClosed,
}

struct IdleConnection<C> {
    conn: C,
    idle_since: Instant,
}

struct PoolInner<M: ConnectionManager> {
    manager: Arc<M>,
    config: PoolConfig,
    guards: SessionGuards,
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleConnection<M::Connection>>>,
    total: AtomicU32,
    idle_count: AtomicU32,
    borrowed: AtomicU32,
    waiting: AtomicU32,
    closed: AtomicBool,
    released: Notify,
    listeners: Vec<Arc<dyn PoolEventListener>>,
    stats: Arc<AcquireStats>,
}

/// Bounded connection pool. Cheap to clone; clones share the same connections.
pub struct ConnectionPool<M: ConnectionManager> {
    inner: Arc<PoolInner<M>>,
}

impl<M: ConnectionManager> Clone for ConnectionPool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: ConnectionManager> std::fmt::Debug for ConnectionPool<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("target", &self.inner.manager.describe())
            .field("status", &self.status())
            .field("acquire_stats", &self.inner.stats.snapshot())
            .finish()
    }
}

impl<M: ConnectionManager> ConnectionPool<M> {
    pub fn new(manager: M, config: PoolConfig) -> ConfigResult<Self> {
        Self::with_listeners(manager, config, Vec::new())
    }

    /// Build a pool whose lifecycle events are delivered to `listeners`.
    pub fn with_listeners(
        manager: M,
        config: PoolConfig,
        listeners: Vec<Arc<dyn PoolEventListener>>,
    ) -> ConfigResult<Self> {
        config.validate()?;

        let guards = SessionGuards::from_query_timeout(config.query_timeout());
        info!(
            target_db = %manager.describe(),
            max_connections = config.max_connections,
            connection_timeout_ms = config.connection_timeout_ms,
            idle_timeout_ms = config.idle_timeout_ms,
            statement_timeout_ms = guards.statement_timeout.as_millis() as u64,
            "🏊 Connection pool initialized"
        );

        let stats = Arc::new(AcquireStats::default());
        let mut all_listeners: Vec<Arc<dyn PoolEventListener>> =
            Vec::with_capacity(listeners.len() + 1);
        all_listeners.push(Arc::clone(&stats) as Arc<dyn PoolEventListener>);
        all_listeners.extend(listeners);

        let inner = PoolInner {
            manager: Arc::new(manager),
            semaphore: Arc::new(Semaphore::new(config.max_connections as usize)),
            idle: Mutex::new(VecDeque::new()),
            total: AtomicU32::new(0),
            idle_count: AtomicU32::new(0),
            borrowed: AtomicU32::new(0),
            waiting: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            released: Notify::new(),
            listeners: all_listeners,
            stats,
            guards,
            config,
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Borrow a connection, waiting at most `connection_timeout_ms` for one to free up.
    pub async fn acquire(&self) -> Result<PooledConnection<M>, PoolError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            inner.emit(&PoolEvent::Rejected);
            return Err(PoolError::Closed);
        }

        let started = tokio::time::Instant::now();
        let timeout = inner.config.connection_timeout();
        // One budget covers both the wait for a permit and opening a connection
        let deadline = started + timeout;

        let permit = {
            let _waiting = WaitingGuard::enter(&inner.waiting);
            match tokio::time::timeout_at(deadline, Arc::clone(&inner.semaphore).acquire_owned())
                .await
            {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => {
                    inner.emit(&PoolEvent::Rejected);
                    return Err(PoolError::Closed);
                }
                Err(_) => {
                    let waited = started.elapsed();
                    warn!(
                        target_db = %inner.manager.describe(),
                        waited_ms = waited.as_millis() as u64,
                        max_connections = inner.config.max_connections,
                        waiting = inner.waiting.load(Ordering::Relaxed),
                        "⏳ Connection pool exhausted"
                    );
                    inner.emit(&PoolEvent::AcquireTimeout { waited });
                    return Err(PoolError::Exhausted { timeout });
                }
            }
        };

        // Counted as borrowed from here on, so close() waits for a connect in flight
        let pending = PendingBorrow::enter(inner);

        // close() may have won the race after the permit was granted
        if inner.closed.load(Ordering::SeqCst) {
            inner.emit(&PoolEvent::Rejected);
            return Err(PoolError::Closed);
        }

        let conn = match inner.take_idle() {
            Some(conn) => conn,
            None => inner.open_connection(deadline).await?,
        };

        // ...or while the connection was being opened
        if inner.closed.load(Ordering::SeqCst) {
            inner.discard(conn, RemoveReason::Shutdown);
            inner.emit(&PoolEvent::Rejected);
            return Err(PoolError::Closed);
        }

        pending.hand_over();
        let wait = started.elapsed();
        inner.emit(&PoolEvent::Acquire { wait });

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(inner),
            _permit: permit,
            in_transaction: false,
            broken: false,
        })
    }

    /// Stop accepting acquires, wait up to `drain_timeout` for borrowed
    /// connections to come back, then close every idle connection.
    ///
    /// Safe to call more than once; later calls return [`DrainOutcome::AlreadyClosed`].
    pub async fn close(&self, drain_timeout: Duration) -> DrainOutcome {
        let inner = &self.inner;
        // SeqCst pairs with PendingBorrow::enter: either close() sees the borrow
        // or the acquire sees the pool closed
        if inner.closed.swap(true, Ordering::SeqCst) {
            debug!(target_db = %inner.manager.describe(), "Connection pool already closed");
            return DrainOutcome::AlreadyClosed;
        }
        inner.semaphore.close();

        info!(
            target_db = %inner.manager.describe(),
            in_flight = inner.borrowed.load(Ordering::Acquire),
            drain_timeout_ms = drain_timeout.as_millis() as u64,
            "🛑 Closing connection pool"
        );

        let drained = tokio::time::timeout(drain_timeout, inner.wait_for_release())
            .await
            .is_ok();
        let closed_idle = inner.close_idle().await;

        if drained {
            info!(closed_idle, "✅ Connection pool drained and closed");
            DrainOutcome::Drained { closed_idle }
        } else {
            let outstanding = inner.borrowed.load(Ordering::Acquire);
            warn!(
                outstanding,
                closed_idle,
                drain_timeout_ms = drain_timeout.as_millis() as u64,
                "⚠️ Drain timeout elapsed; outstanding connections will be closed on return"
            );
            DrainOutcome::TimedOut {
                outstanding,
                closed_idle,
            }
        }
    }

    /// Close idle connections older than `idle_timeout_ms`. Returns how many were closed.
    pub fn reap_idle(&self) -> usize {
        let stale = self.inner.drain_stale_idle();
        let count = stale.len();
        for conn in stale {
            self.inner.discard(conn, RemoveReason::IdleTimeout);
        }
        count
    }

    pub fn status(&self) -> PoolStatus {
        let inner = &self.inner;
        PoolStatus {
            total_count: inner.total.load(Ordering::Acquire),
            idle_count: inner.idle_count.load(Ordering::Acquire),
            waiting_count: inner.waiting.load(Ordering::Acquire),
            max_connections: inner.config.max_connections,
            is_closed: inner.closed.load(Ordering::Acquire),
        }
    }

    /// Acquire latency and failure counts since the pool was built
    pub fn stats(&self) -> AcquireStatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn manager(&self) -> &Arc<M> {
        &self.inner.manager
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn session_guards(&self) -> SessionGuards {
        self.inner.guards
    }
}

impl<M: ConnectionManager> PoolInner<M> {
    fn emit(&self, event: &PoolEvent) {
        for listener in &self.listeners {
            listener.on_event(event);
        }
    }

    /// Pop the most recently returned usable connection, closing stale ones on the way.
    fn take_idle(&self) -> Option<M::Connection> {
        let mut stale = self.drain_stale_idle();
        let mut invalid = Vec::new();

        let found = {
            let mut idle = self.idle.lock();
            let mut found = None;
            while let Some(entry) = idle.pop_back() {
                if self.manager.is_valid(&entry.conn) {
                    found = Some(entry.conn);
                    break;
                }
                invalid.push(entry.conn);
            }
            self.idle_count.store(idle.len() as u32, Ordering::Release);
            found
        };

        for conn in stale.drain(..) {
            self.discard(conn, RemoveReason::IdleTimeout);
        }
        for conn in invalid {
            self.discard(conn, RemoveReason::Invalid);
        }
        found
    }

    fn drain_stale_idle(&self) -> Vec<M::Connection> {
        let idle_timeout = self.config.idle_timeout();
        let mut idle = self.idle.lock();
        let mut stale = Vec::new();
        // Oldest entries sit at the front
        while idle
            .front()
            .is_some_and(|entry| entry.idle_since.elapsed() >= idle_timeout)
        {
            if let Some(entry) = idle.pop_front() {
                stale.push(entry.conn);
            }
        }
        self.idle_count.store(idle.len() as u32, Ordering::Release);
        stale
    }

    async fn open_connection(
        &self,
        deadline: tokio::time::Instant,
    ) -> Result<M::Connection, PoolError> {
        let connect = async {
            let mut conn = self.manager.connect().await?;
            if let Err(e) = self
                .manager
                .apply_session_guards(&mut conn, &self.guards)
                .await
            {
                self.manager.close(conn).await;
                return Err(e);
            }
            Ok::<_, DbError>(conn)
        };

        let result = match tokio::time::timeout_at(deadline, connect).await {
            Ok(result) => result,
            Err(_) => Err(DbError::new(
                DbErrorKind::Timeout,
                format!(
                    "timed out opening connection within {:?}",
                    self.config.connection_timeout()
                ),
            )),
        };

        match result {
            Ok(conn) => {
                let total = self.total.fetch_add(1, Ordering::AcqRel) + 1;
                debug!(
                    target_db = %self.manager.describe(),
                    total_connections = total,
                    "🔌 Opened database connection"
                );
                self.emit(&PoolEvent::Connect);
                Ok(conn)
            }
            Err(error) => {
                warn!(
                    target_db = %self.manager.describe(),
                    error = %error,
                    retryable = error.is_retryable(),
                    "❌ Failed to open database connection"
                );
                self.emit(&PoolEvent::Error {
                    error: error.clone(),
                });
                Err(PoolError::Connect(error))
            }
        }
    }

    /// Return a borrowed connection. Runs inside `Drop`, so it never awaits.
    fn release(&self, conn: M::Connection, reusable: bool) {
        let reason = if !reusable {
            Some(RemoveReason::Discarded)
        } else if self.closed.load(Ordering::Acquire) {
            Some(RemoveReason::Shutdown)
        } else if !self.manager.is_valid(&conn) {
            Some(RemoveReason::Invalid)
        } else {
            None
        };

        match reason {
            Some(reason) => self.discard(conn, reason),
            None => {
                let mut idle = self.idle.lock();
                idle.push_back(IdleConnection {
                    conn,
                    idle_since: Instant::now(),
                });
                self.idle_count.store(idle.len() as u32, Ordering::Release);
            }
        }

        // Decrement only after the connection is parked so close() cannot miss it
        self.borrowed.fetch_sub(1, Ordering::AcqRel);
        self.emit(&PoolEvent::Release);
        self.released.notify_waiters();
    }

    fn discard(&self, conn: M::Connection, reason: RemoveReason) {
        self.total.fetch_sub(1, Ordering::AcqRel);
        debug!(target_db = %self.manager.describe(), ?reason, "Closing database connection");
        self.emit(&PoolEvent::Remove { reason });

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let manager = Arc::clone(&self.manager);
                handle.spawn(async move {
                    manager.close(conn).await;
                });
            }
            Err(_) => drop(conn),
        }
    }

    async fn wait_for_release(&self) {
        loop {
            let notified = self.released.notified();
            if self.borrowed.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    async fn close_idle(&self) -> usize {
        let idle: Vec<_> = {
            let mut idle = self.idle.lock();
            self.idle_count.store(0, Ordering::Release);
            idle.drain(..).collect()
        };

        let count = idle.len();
        for entry in idle {
            self.total.fetch_sub(1, Ordering::AcqRel);
            self.emit(&PoolEvent::Remove {
                reason: RemoveReason::Shutdown,
            });
            self.manager.close(entry.conn).await;
        }
        count
    }
}

/// Counts a caller as waiting for as long as it is suspended in `acquire()`,
/// including when the acquire future is dropped.
struct WaitingGuard<'a>(&'a AtomicU32);

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicU32) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Holds a slot in `borrowed` between permit grant and hand-over. Dropping it
/// early (connect failure, cancelled acquire) gives the slot back.
struct PendingBorrow<'a, M: ConnectionManager> {
    pool: &'a PoolInner<M>,
    armed: bool,
}

impl<'a, M: ConnectionManager> PendingBorrow<'a, M> {
    fn enter(pool: &'a PoolInner<M>) -> Self {
        pool.borrowed.fetch_add(1, Ordering::SeqCst);
        Self { pool, armed: true }
    }

    /// The slot now belongs to the [`PooledConnection`] and is released by its `Drop`.
    fn hand_over(mut self) {
        self.armed = false;
    }
}

impl<M: ConnectionManager> Drop for PendingBorrow<'_, M> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.borrowed.fetch_sub(1, Ordering::AcqRel);
            self.pool.released.notify_waiters();
        }
    }
}

/// A borrowed connection. Returned to the pool when dropped.
pub struct PooledConnection<M: ConnectionManager> {
    conn: Option<M::Connection>,
    pool: Arc<PoolInner<M>>,
    // Released after `conn` is parked back in the pool
    _permit: OwnedSemaphorePermit,
    in_transaction: bool,
    broken: bool,
}

impl<M: ConnectionManager> PooledConnection<M> {
    /// Close this connection on release instead of reusing it.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub(crate) fn set_in_transaction(&mut self, in_transaction: bool) {
        self.in_transaction = in_transaction;
    }
}

impl<M: ConnectionManager> std::fmt::Debug for PooledConnection<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("target", &self.pool.manager.describe())
            .field("in_transaction", &self.in_transaction)
            .field("broken", &self.broken)
            .finish()
    }
}

impl<M: ConnectionManager> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        match self.conn.as_ref() {
            Some(conn) => conn,
            None => unreachable!("pooled connection is only taken on drop"),
        }
    }
}

impl<M: ConnectionManager> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self.conn.as_mut() {
            Some(conn) => conn,
            None => unreachable!("pooled connection is only taken on drop"),
        }
    }
}

impl<M: ConnectionManager> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let reusable = !(self.broken || self.in_transaction);
            self.pool.release(conn, reusable);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{MockConnectionManager, RecordingListener};

    fn config(max_connections: u32, connection_timeout_ms: u64) -> PoolConfig {
        PoolConfig {
            max_connections,
            connection_timeout_ms,
            idle_timeout_ms: 60_000,
            query_timeout_ms: 3_000,
            retry_attempts: 1,
        }
    }

    #[tokio::test]
    async fn test_acquire_applies_session_guards_and_reuses() {
        let manager = MockConnectionManager::new();
        let pool = ConnectionPool::new(manager.clone(), config(2, 100)).unwrap();

        let first_id = {
            let conn = pool.acquire().await.unwrap();
            assert_eq!(
                conn.guards,
                Some(SessionGuards::from_query_timeout(Duration::from_secs(3)))
            );
            conn.id
        };

        let status = pool.status();
        assert_eq!(status.total_count, 1);
        assert_eq!(status.idle_count, 1);

        let again = pool.acquire().await.unwrap();
        assert_eq!(again.id, first_id);
        assert_eq!(manager.stats().connects, 1);
    }

    #[tokio::test]
    async fn test_exhaustion_after_connection_timeout() {
        let pool = ConnectionPool::new(MockConnectionManager::new(), config(1, 50)).unwrap();
        let _held = pool.acquire().await.unwrap();

        let started = Instant::now();
        let err = pool.acquire().await.unwrap_err();
        assert_eq!(
            err,
            PoolError::Exhausted {
                timeout: Duration::from_millis(50)
            }
        );
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(pool.status().waiting_count, 0);
        assert_eq!(pool.stats().timeouts, 1);
        assert_eq!(pool.stats().borrows, 1);
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let manager = MockConnectionManager::new();
        manager.fail_next_connects(vec![DbError::from_message("connect ECONNREFUSED")]);
        let listener = Arc::new(RecordingListener::default());
        let pool = ConnectionPool::with_listeners(
            manager,
            config(1, 100),
            vec![listener.clone() as Arc<dyn PoolEventListener>],
        )
        .unwrap();

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::Connect(ref e) if e.kind() == DbErrorKind::ConnectionRefused));
        assert!(listener
            .events()
            .iter()
            .any(|e| matches!(e, PoolEvent::Error { .. })));

        // Permit was returned; the next acquire succeeds
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_broken_and_transactional_connections_are_discarded() {
        let manager = MockConnectionManager::new();
        let pool = ConnectionPool::new(manager.clone(), config(2, 100)).unwrap();

        {
            let mut conn = pool.acquire().await.unwrap();
            conn.mark_broken();
        }
        {
            let mut conn = pool.acquire().await.unwrap();
            conn.set_in_transaction(true);
        }

        let status = pool.status();
        assert_eq!(status.total_count, 0);
        assert_eq!(status.idle_count, 0);
        assert_eq!(manager.stats().connects, 2);
    }

    #[tokio::test]
    async fn test_idle_timeout_reaps_connections() {
        let mut cfg = config(2, 100);
        cfg.idle_timeout_ms = 20;
        let pool = ConnectionPool::new(MockConnectionManager::new(), cfg).unwrap();

        drop(pool.acquire().await.unwrap());
        assert_eq!(pool.status().idle_count, 1);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(pool.reap_idle(), 1);
        assert_eq!(pool.status().total_count, 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_rejects_acquire() {
        let manager = MockConnectionManager::new();
        let pool = ConnectionPool::new(manager.clone(), config(2, 100)).unwrap();
        drop(pool.acquire().await.unwrap());

        let outcome = pool.close(Duration::from_millis(100)).await;
        assert_eq!(outcome, DrainOutcome::Drained { closed_idle: 1 });
        assert_eq!(
            pool.close(Duration::from_millis(100)).await,
            DrainOutcome::AlreadyClosed
        );

        assert_eq!(pool.acquire().await.unwrap_err(), PoolError::Closed);
        assert_eq!(manager.stats().closes, 1);
        assert!(pool.status().is_closed);
    }

    #[tokio::test]
    async fn test_close_waits_for_borrowed_connection() {
        let pool = ConnectionPool::new(MockConnectionManager::new(), config(2, 100)).unwrap();
        let conn = pool.acquire().await.unwrap();

        let holder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(conn);
        });

        let outcome = pool.close(Duration::from_secs(1)).await;
        assert_eq!(outcome, DrainOutcome::Drained { closed_idle: 0 });
        holder.await.unwrap();
        assert_eq!(pool.status().total_count, 0);
    }

    #[tokio::test]
    async fn test_close_waits_for_connect_in_flight() {
        let manager = MockConnectionManager::new();
        manager.set_connect_delay(Duration::from_millis(200));
        let pool = ConnectionPool::new(manager.clone(), config(2, 1_000)).unwrap();

        let connecting = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|conn| conn.id) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        let outcome = pool.close(Duration::from_millis(500)).await;
        assert_eq!(outcome, DrainOutcome::Drained { closed_idle: 0 });
        assert!(started.elapsed() >= Duration::from_millis(100));

        // The connection finished opening after close began, so it is never handed out
        assert_eq!(connecting.await.unwrap(), Err(PoolError::Closed));
        assert_eq!(pool.status().total_count, 0);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.stats().connects, 1);
        assert_eq!(manager.stats().closes, 1);
    }

    #[tokio::test]
    async fn test_connect_shares_the_acquire_budget() {
        let manager = MockConnectionManager::new();
        let pool = ConnectionPool::new(manager.clone(), config(1, 150)).unwrap();

        let mut first = pool.acquire().await.unwrap();
        first.mark_broken();
        manager.set_connect_delay(Duration::from_secs(5));
        let holder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            drop(first);
        });

        let started = Instant::now();
        let err = pool.acquire().await.unwrap_err();
        let elapsed = started.elapsed();
        holder.await.unwrap();

        assert!(matches!(err, PoolError::Connect(ref e) if e.kind() == DbErrorKind::Timeout));
        assert!(elapsed >= Duration::from_millis(150));
        assert!(elapsed < Duration::from_millis(220), "acquire took {elapsed:?}");
        assert_eq!(pool.stats().connect_failures, 1);

        // The failed connect gave its borrow slot back
        assert_eq!(
            pool.close(Duration::from_millis(20)).await,
            DrainOutcome::Drained { closed_idle: 0 }
        );
    }

    #[tokio::test]
    async fn test_close_times_out_on_stuck_borrower() {
        let pool = ConnectionPool::new(MockConnectionManager::new(), config(2, 100)).unwrap();
        let stuck = pool.acquire().await.unwrap();

        let outcome = pool.close(Duration::from_millis(30)).await;
        assert_eq!(
            outcome,
            DrainOutcome::TimedOut {
                outstanding: 1,
                closed_idle: 0
            }
        );

        // Returned after close: closed rather than parked
        drop(stuck);
        let status = pool.status();
        assert_eq!(status.total_count, 0);
        assert_eq!(status.idle_count, 0);
    }
}
