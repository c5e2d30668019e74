//! # Configuration
//!
//! Typed configuration for the pool, retry policy, health monitor and shutdown
//! coordinator. Every section has defaults so an empty source produces a usable
//! configuration; [`ConfigManager`] layers a TOML file and `RESILIENT_DB_*`
//! environment overrides on top.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use resilient_db::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let pool = &manager.config().pool;
//! println!("max connections: {}", pool.max_connections);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ResilientDbConfig {
    pub pool: PoolConfig,
    pub retry: RetryConfig,
    pub health: HealthConfig,
    pub shutdown: ShutdownConfig,
}

impl ResilientDbConfig {
    /// Wrap a pool configuration with default settings for the other sections.
    pub fn with_pool(pool: PoolConfig) -> Self {
        Self {
            pool,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.pool.validate()?;
        self.retry.validate()?;
        self.health.validate()?;
        self.shutdown.validate()
    }
}

/// Connection pool parameters. Immutable once the pool is built.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub idle_timeout_ms: u64,
    pub connection_timeout_ms: u64,
    pub query_timeout_ms: u64,
    /// Total tries per query, including the first
    pub retry_attempts: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 20,
            idle_timeout_ms: 30_000,
            connection_timeout_ms: 5_000,
            query_timeout_ms: 30_000,
            retry_attempts: 3,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_connections < 1 {
            return Err(ConfigurationError::invalid_value(
                "pool.max_connections",
                self.max_connections,
                "must be at least 1",
            ));
        }
        for (field, value) in [
            ("pool.idle_timeout_ms", self.idle_timeout_ms),
            ("pool.connection_timeout_ms", self.connection_timeout_ms),
            ("pool.query_timeout_ms", self.query_timeout_ms),
            ("pool.retry_attempts", u64::from(self.retry_attempts)),
        ] {
            if value == 0 {
                return Err(ConfigurationError::invalid_value(
                    field,
                    value,
                    "must be greater than 0",
                ));
            }
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

/// Backoff between retry attempts: `base * 2^(attempt-1)`, capped at `max_delay_ms`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.base_delay_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "retry.base_delay_ms",
                self.base_delay_ms,
                "must be greater than 0",
            ));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(ConfigurationError::invalid_value(
                "retry.max_delay_ms",
                self.max_delay_ms,
                "must not be smaller than retry.base_delay_ms",
            ));
        }
        Ok(())
    }
}

/// Health monitor cadence and warning thresholds
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_ms: u64,
    pub max_waiting: u32,
    pub max_avg_query_time_ms: f64,
    pub max_errors: u64,
    /// Queries slower than this are counted and logged
    pub slow_query_threshold_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            max_waiting: 5,
            max_avg_query_time_ms: 200.0,
            max_errors: 10,
            slow_query_threshold_ms: 100,
        }
    }
}

impl HealthConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.interval_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "health.interval_ms",
                self.interval_ms,
                "must be greater than 0",
            ));
        }
        if !self.max_avg_query_time_ms.is_finite() || self.max_avg_query_time_ms <= 0.0 {
            return Err(ConfigurationError::invalid_value(
                "health.max_avg_query_time_ms",
                self.max_avg_query_time_ms,
                "must be a positive number",
            ));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn slow_query_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_query_threshold_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// How long `close()` waits for borrowed connections before forcing
    pub drain_timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: 10_000,
        }
    }
}

impl ShutdownConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.drain_timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "shutdown.drain_timeout_ms",
                self.drain_timeout_ms,
                "must be greater than 0",
            ));
        }
        Ok(())
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}
