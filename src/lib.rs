#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Resilient DB
//!
//! Resilient query execution over a bounded PostgreSQL connection pool.
//!
//! ## Overview
//!
//! Callers hand a named operation to the [`QueryExecutor`]. The executor borrows
//! a connection from the [`ConnectionPool`], optionally wraps the operation in a
//! transaction, retries transient failures with exponential backoff and records
//! metrics for every call. A [`HealthMonitor`] watches those metrics and a
//! [`ShutdownCoordinator`] drains the pool on SIGTERM/SIGINT.
//!
//! ## Module Organization
//!
//! - [`database`] - Connection manager seam, PostgreSQL adapter and the pool
//! - [`executor`] - Query execution with retries, transactions and cancellation
//! - [`metrics`] - Query counters, running latency average and OpenTelemetry export
//! - [`monitoring`] - Periodic health snapshots and threshold warnings
//! - [`shutdown`] - Signal handling and bounded pool drain
//! - [`config`] - Layered configuration (defaults, TOML, environment)
//! - [`error`] - Error taxonomy and driver error classification
//! - [`logging`] - Structured console and JSON file logging
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use resilient_db::config::PoolConfig;
//! use resilient_db::error::DbError;
//! use resilient_db::executor::{QueryExecutor, QueryOptions};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! resilient_db::logging::init_structured_logging();
//!
//! let executor = QueryExecutor::new(PoolConfig::default())?;
//! let healthy = executor.health_check().await;
//!
//! executor
//!     .execute(
//!         "touch_session",
//!         |conn| {
//!             Box::pin(async move {
//!                 sqlx::query("UPDATE sessions SET seen_at = now() WHERE id = 1")
//!                     .execute(&mut *conn)
//!                     .await?;
//!                 Ok::<_, DbError>(())
//!             })
//!         },
//!         QueryOptions::transactional(),
//!     )
//!     .await?;
//!
//! println!("healthy: {healthy}, metrics: {:?}", executor.metrics());
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! [`test_helpers::MockConnectionManager`] provides an in-memory connection
//! manager so pool and executor behavior can be tested without PostgreSQL.
//! Tests that need a real database are `#[ignore]`d and read `DATABASE_URL`.

pub mod config;
pub mod database;
pub mod error;
pub mod executor;
pub mod logging;
pub mod metrics;
pub mod monitoring;
pub mod shutdown;
pub mod test_helpers;

pub use config::{ConfigManager, ConfigurationError, PoolConfig, ResilientDbConfig};
pub use database::{
    ConnectionManager, ConnectionPool, DrainOutcome, PgConnectionManager, PoolEvent,
    PoolEventListener, PoolStatus, PooledConnection,
};
pub use error::{DbError, DbErrorKind, PoolError, QueryError, QueryResult};
pub use executor::{QueryExecutor, QueryOptions, RetryPolicy};
pub use metrics::{MetricsCollector, MetricsSource, QueryMetrics};
pub use monitoring::{HealthMonitor, HealthReport, HealthWarning};
pub use shutdown::{Drainable, ShutdownCoordinator};
