//! # Database Layer
//!
//! Connection management for the query executor.
//!
//! ## Key Components
//!
//! - [`manager`] - The [`ConnectionManager`] seam and per-session guards
//! - [`connection`] - PostgreSQL adapter built on SQLx
//! - [`pool`] - Bounded [`ConnectionPool`] with scoped [`PooledConnection`] borrows
//! - [`events`] - Pool lifecycle events for observers
//! - [`acquire_stats`] - Acquire latency gathered from pool events
//! - [`error_codes`] - SQLSTATE constants and classification
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use resilient_db::config::PoolConfig;
//! use resilient_db::database::{ConnectionManager, ConnectionPool, PgConnectionManager};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = PgConnectionManager::from_env()?;
//! let pool = ConnectionPool::new(manager, PoolConfig::default())?;
//!
//! let mut conn = pool.acquire().await?;
//! pool.manager().ping(&mut *conn).await?;
//! # Ok(())
//! # }
//! ```

pub mod acquire_stats;
pub mod connection;
pub mod error_codes;
pub mod events;
pub mod manager;
pub mod pool;

pub use acquire_stats::{AcquireStats, AcquireStatsSnapshot};
pub use connection::PgConnectionManager;
pub use error_codes::PgErrorCode;
pub use events::{PoolEvent, PoolEventListener, RemoveReason};
pub use manager::{ConnectionManager, SessionGuards};
pub use pool::{ConnectionPool, DrainOutcome, PoolStatus, PooledConnection};
