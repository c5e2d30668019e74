//! # Query Executor
//!
//! Runs named database operations against the pool with bounded retries,
//! optional transactions, cancellation and metrics.
//!
//! Each call to [`QueryExecutor::execute`] goes through up to `retry_attempts`
//! tries. A try acquires a connection, optionally opens a transaction, runs the
//! operation, then commits or rolls back. The connection returns to the pool
//! on every exit path because it is held by a [`PooledConnection`] guard.
//! Transient failures back off exponentially before the next try; everything
//! else ends the call immediately.

use super::invocation::QueryInvocation;
use super::retry::RetryPolicy;
use crate::config::{PoolConfig, ResilientDbConfig};
use crate::database::{
    ConnectionManager, ConnectionPool, DrainOutcome, PgConnectionManager, PoolEventListener,
    PooledConnection,
};
use crate::error::{DbError, DbErrorKind, PoolError, QueryError, QueryResult};
use crate::logging::log_query_operation;
use crate::metrics::{MetricsCollector, MetricsSource, QueryMetrics};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Per-call execution options
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Wrap the operation in `BEGIN` / `COMMIT`, rolling back on failure
    pub use_transaction: bool,
    /// Overall deadline for the call, retries and backoff included
    pub timeout: Option<Duration>,
    /// Cancels the call at acquire, during the operation or during backoff
    pub cancellation: Option<CancellationToken>,
    /// Override the configured number of tries
    pub max_attempts: Option<u32>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transactional() -> Self {
        Self {
            use_transaction: true,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }
}

/// Why an in-flight step was abandoned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Cancelled,
    DeadlineExceeded,
}

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interrupt::Cancelled => f.write_str("cancelled by caller"),
            Interrupt::DeadlineExceeded => f.write_str("deadline exceeded"),
        }
    }
}

/// How a single try failed
#[derive(Debug)]
enum AttemptFailure {
    Pool(PoolError),
    Operation(DbError),
    Interrupted(Interrupt),
}

impl AttemptFailure {
    fn is_retryable(&self) -> bool {
        match self {
            AttemptFailure::Pool(PoolError::Connect(e)) | AttemptFailure::Operation(e) => {
                e.is_retryable()
            }
            AttemptFailure::Pool(_) | AttemptFailure::Interrupted(_) => false,
        }
    }
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptFailure::Pool(e) => write!(f, "{e}"),
            AttemptFailure::Operation(e) => write!(f, "{e}"),
            AttemptFailure::Interrupted(i) => write!(f, "{i}"),
        }
    }
}

/// Connection-level failures leave the session in an unknown state
fn invalidates_connection(kind: DbErrorKind) -> bool {
    matches!(
        kind,
        DbErrorKind::ConnectionReset
            | DbErrorKind::ConnectionRefused
            | DbErrorKind::ConnectionLost
            | DbErrorKind::HostUnreachable
    )
}

/// Start the caller's operation with panics caught both while the closure
/// builds its future and while that future is polled.
fn start_operation<'c, C, T, F>(
    operation: &mut F,
    conn: &'c mut C,
) -> BoxFuture<'c, std::thread::Result<Result<T, DbError>>>
where
    T: Send + 'c,
    F: for<'x> FnMut(&'x mut C) -> BoxFuture<'x, Result<T, DbError>>,
{
    let started = std::panic::catch_unwind(AssertUnwindSafe(move || {
        let conn = conn;
        operation(conn)
    }));

    match started {
        Ok(future) => AssertUnwindSafe(future).catch_unwind().boxed(),
        Err(panic) => futures::future::ready(Err(panic)).boxed(),
    }
}

/// Race `fut` against caller cancellation and the call deadline.
async fn guarded<F: Future>(
    fut: F,
    cancel: &CancellationToken,
    deadline: Option<Instant>,
) -> Result<F::Output, Interrupt> {
    let expiry = async move {
        match deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Interrupt::Cancelled),
        _ = expiry => Err(Interrupt::DeadlineExceeded),
        output = fut => Ok(output),
    }
}

/// Resilient query executor over a [`ConnectionPool`].
///
/// ```rust,no_run
/// use resilient_db::config::PoolConfig;
/// use resilient_db::error::DbError;
/// use resilient_db::executor::{QueryExecutor, QueryOptions};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let executor = QueryExecutor::new(PoolConfig::default())?;
///
/// let count: i64 = executor
///     .execute(
///         "count_athletes",
///         |conn| {
///             Box::pin(async move {
///                 let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM athletes")
///                     .fetch_one(&mut *conn)
///                     .await
///                     .map_err(DbError::from)?;
///                 Ok::<_, DbError>(row.0)
///             })
///         },
///         QueryOptions::new(),
///     )
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct QueryExecutor<M: ConnectionManager = PgConnectionManager> {
    pool: ConnectionPool<M>,
    metrics: Arc<MetricsCollector>,
    retry: RetryPolicy,
    config: ResilientDbConfig,
}

impl<M: ConnectionManager> Clone for QueryExecutor<M> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            metrics: Arc::clone(&self.metrics),
            retry: self.retry,
            config: self.config.clone(),
        }
    }
}

impl<M: ConnectionManager> fmt::Debug for QueryExecutor<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryExecutor")
            .field("pool", &self.pool)
            .field("retry", &self.retry)
            .finish()
    }
}

impl QueryExecutor<PgConnectionManager> {
    /// Build an executor for the database named by `DATABASE_URL`.
    ///
    /// Fails with [`QueryError::Configuration`] when the variable is absent or
    /// not a valid PostgreSQL connection string, or when `config` is invalid.
    /// Connections are opened lazily on first use.
    pub fn new(config: PoolConfig) -> QueryResult<Self> {
        let manager = PgConnectionManager::from_env()?;
        Self::with_manager(manager, ResilientDbConfig::with_pool(config))
    }

    /// Build an executor from a full configuration and an explicit connection string.
    pub fn from_config(config: ResilientDbConfig, database_url: &str) -> QueryResult<Self> {
        let manager = PgConnectionManager::from_url(database_url)?;
        Self::with_manager(manager, config)
    }
}

impl<M: ConnectionManager> QueryExecutor<M> {
    pub fn with_manager(manager: M, config: ResilientDbConfig) -> QueryResult<Self> {
        config.validate()?;

        let metrics = Arc::new(MetricsCollector::new(
            config.health.slow_query_threshold(),
        ));
        let pool = ConnectionPool::with_listeners(
            manager,
            config.pool.clone(),
            vec![Arc::clone(&metrics) as Arc<dyn PoolEventListener>],
        )?;
        let retry = RetryPolicy::from(&config.retry);

        info!(
            target_db = %pool.manager().describe(),
            retry_attempts = config.pool.retry_attempts,
            base_delay_ms = config.retry.base_delay_ms,
            max_delay_ms = config.retry.max_delay_ms,
            slow_query_threshold_ms = config.health.slow_query_threshold_ms,
            "✅ Query executor initialized"
        );

        Ok(Self {
            pool,
            metrics,
            retry,
            config,
        })
    }

    /// Run `operation` with retries, producing exactly one result or one error.
    ///
    /// The operation receives the borrowed connection and may be invoked once per
    /// try, so it must be safe to repeat. Errors it returns are classified by
    /// [`DbError::kind`]: transient kinds are retried while tries remain, all
    /// other kinds end the call with [`QueryError::TerminalQuery`].
    ///
    /// A panic inside the operation rolls back any open transaction, discards
    /// the connection and is then resumed in the caller.
    #[instrument(skip(self, name, operation, options), fields(query = %name))]
    pub async fn execute<T, F>(
        &self,
        name: &str,
        mut operation: F,
        options: QueryOptions,
    ) -> QueryResult<T>
    where
        T: Send,
        F: for<'c> FnMut(&'c mut M::Connection) -> BoxFuture<'c, Result<T, DbError>> + Send,
    {
        if name.trim().is_empty() {
            return Err(QueryError::InvalidInput(
                "query name must not be empty".to_string(),
            ));
        }

        let max_attempts = options
            .max_attempts
            .unwrap_or(self.config.pool.retry_attempts)
            .max(1);
        let mut invocation = QueryInvocation::new(name, options.use_transaction, max_attempts);
        let deadline = options.timeout.map(|timeout| Instant::now() + timeout);
        let cancel = options
            .cancellation
            .unwrap_or_else(CancellationToken::new);

        self.metrics.record_query_started(name);
        debug!(
            query_id = %invocation.id,
            use_transaction = invocation.use_transaction,
            max_attempts,
            "Executing query"
        );

        while invocation.begin_attempt() {
            let attempt_started = Instant::now();
            let failure = match self
                .run_attempt(&invocation, &mut operation, &cancel, deadline)
                .await
            {
                Ok(value) => {
                    self.metrics
                        .record_duration(name, attempt_started.elapsed());
                    log_query_operation(
                        name,
                        "success",
                        invocation.attempt,
                        invocation.elapsed(),
                        None,
                    );
                    return Ok(value);
                }
                Err(failure) => failure,
            };

            match &failure {
                AttemptFailure::Operation(e) => {
                    self.metrics
                        .record_duration(name, attempt_started.elapsed());
                    self.metrics.record_error(e.kind().as_str());
                }
                AttemptFailure::Interrupted(_) => self.metrics.record_error("cancelled"),
                // Counted by the collector through pool events
                AttemptFailure::Pool(_) => {}
            }

            if failure.is_retryable() && invocation.has_attempts_remaining() {
                let delay = self.retry.delay_for(invocation.attempt);
                warn!(
                    query_id = %invocation.id,
                    attempt = invocation.attempt,
                    attempts_remaining = invocation.attempts_remaining,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure,
                    "🔄 Transient failure, retrying query after backoff"
                );

                if let Err(interrupt) = guarded(sleep(delay), &cancel, deadline).await {
                    self.metrics.record_error("cancelled");
                    return Err(self.finish(
                        &invocation,
                        AttemptFailure::Interrupted(interrupt),
                    ));
                }
                continue;
            }

            return Err(self.finish(&invocation, failure));
        }

        // begin_attempt() only fails once the budget is spent, and every path
        // through the loop body returns before that can happen.
        unreachable!("retry loop exited without a terminal outcome")
    }

    async fn run_attempt<T, F>(
        &self,
        invocation: &QueryInvocation,
        operation: &mut F,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<T, AttemptFailure>
    where
        T: Send,
        F: for<'c> FnMut(&'c mut M::Connection) -> BoxFuture<'c, Result<T, DbError>> + Send,
    {
        let mut conn = match guarded(self.pool.acquire(), cancel, deadline).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Err(AttemptFailure::Pool(e)),
            Err(interrupt) => return Err(AttemptFailure::Interrupted(interrupt)),
        };
        let manager = Arc::clone(self.pool.manager());

        if invocation.use_transaction {
            match guarded(manager.begin(&mut *conn), cancel, deadline).await {
                Ok(Ok(())) => conn.set_in_transaction(true),
                Ok(Err(e)) => {
                    conn.mark_broken();
                    return Err(AttemptFailure::Operation(e));
                }
                Err(interrupt) => {
                    conn.mark_broken();
                    return Err(AttemptFailure::Interrupted(interrupt));
                }
            }
        }

        let outcome = guarded(start_operation(operation, &mut *conn), cancel, deadline).await;

        match outcome {
            Ok(Ok(Ok(value))) => {
                if conn.in_transaction() {
                    match guarded(manager.commit(&mut *conn), cancel, deadline).await {
                        Ok(Ok(())) => conn.set_in_transaction(false),
                        Ok(Err(e)) => {
                            self.rollback(&mut conn).await;
                            return Err(AttemptFailure::Operation(e));
                        }
                        Err(interrupt) => {
                            conn.mark_broken();
                            return Err(AttemptFailure::Interrupted(interrupt));
                        }
                    }
                }
                Ok(value)
            }
            Ok(Ok(Err(e))) => {
                if conn.in_transaction() {
                    self.rollback(&mut conn).await;
                }
                if invalidates_connection(e.kind()) {
                    conn.mark_broken();
                }
                Err(AttemptFailure::Operation(e))
            }
            Ok(Err(panic)) => {
                warn!(
                    query_id = %invocation.id,
                    attempt = invocation.attempt,
                    "💥 Query operation panicked; discarding connection"
                );
                if conn.in_transaction() {
                    self.rollback(&mut conn).await;
                }
                conn.mark_broken();
                self.metrics.record_error("panic");
                drop(conn);
                std::panic::resume_unwind(panic)
            }
            Err(interrupt) => {
                // Abandoned mid-statement; the session state is unknown
                conn.mark_broken();
                Err(AttemptFailure::Interrupted(interrupt))
            }
        }
    }

    async fn rollback(&self, conn: &mut PooledConnection<M>) {
        match self.pool.manager().rollback(&mut **conn).await {
            Ok(()) => conn.set_in_transaction(false),
            Err(e) => {
                warn!(error = %e, "Rollback failed; discarding connection");
                conn.mark_broken();
            }
        }
    }

    /// Map the last failure to the caller-facing error and log it.
    fn finish(&self, invocation: &QueryInvocation, failure: AttemptFailure) -> QueryError {
        let name = invocation.name.clone();
        let error = match failure {
            AttemptFailure::Pool(PoolError::Exhausted { timeout }) => {
                QueryError::PoolExhausted { timeout }
            }
            AttemptFailure::Pool(PoolError::Closed) => QueryError::ShutdownInProgress,
            AttemptFailure::Pool(PoolError::Connect(source))
            | AttemptFailure::Operation(source) => {
                if source.is_retryable() {
                    QueryError::TransientConnection {
                        query: name,
                        attempts: invocation.attempt,
                        source,
                    }
                } else {
                    QueryError::TerminalQuery {
                        query: name,
                        source,
                    }
                }
            }
            AttemptFailure::Interrupted(interrupt) => QueryError::Cancelled {
                query: name,
                reason: interrupt.to_string(),
            },
        };

        let details = error.to_string();
        log_query_operation(
            &invocation.name,
            "failed",
            invocation.attempt,
            invocation.elapsed(),
            Some(&details),
        );
        warn!(
            query_id = %invocation.id,
            attempts = invocation.attempt,
            error = %error,
            "❌ Query failed"
        );
        error
    }

    /// Run `SELECT 1` (or the manager's equivalent) within `query_timeout_ms`.
    ///
    /// Never retried; any failure, including the timeout, reports `false`.
    pub async fn health_check(&self) -> bool {
        let manager = Arc::clone(self.pool.manager());
        let options = QueryOptions::new()
            .with_timeout(self.config.pool.query_timeout())
            .with_max_attempts(1);

        let result = self
            .execute(
                "health_check",
                move |conn| {
                    let manager = Arc::clone(&manager);
                    Box::pin(async move { manager.ping(conn).await })
                },
                options,
            )
            .await;

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "❌ Database health check failed");
                false
            }
        }
    }

    /// Current counters and pool occupancy. Never waits on the pool.
    pub fn metrics(&self) -> QueryMetrics {
        self.metrics.snapshot(self.pool.status())
    }

    pub fn metrics_collector(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn pool(&self) -> &ConnectionPool<M> {
        &self.pool
    }

    pub fn config(&self) -> &ResilientDbConfig {
        &self.config
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Close the pool using the configured drain timeout.
    pub async fn close(&self) -> DrainOutcome {
        self.pool
            .close(self.config.shutdown.drain_timeout())
            .await
    }
}

impl<M: ConnectionManager> MetricsSource for QueryExecutor<M> {
    fn metrics(&self) -> QueryMetrics {
        QueryExecutor::metrics(self)
    }
}
