//! # Health Monitor
//!
//! Periodically logs a [`QueryMetrics`] snapshot and warns when it crosses the
//! configured thresholds. Detection only: the monitor never changes pool or
//! executor behavior.

use crate::config::HealthConfig;
use crate::metrics::{MetricsSource, QueryMetrics};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Warning thresholds; a metric strictly above its threshold raises a warning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HealthThresholds {
    pub max_waiting: u32,
    pub max_avg_query_time_ms: f64,
    pub max_errors: u64,
}

impl From<&HealthConfig> for HealthThresholds {
    fn from(config: &HealthConfig) -> Self {
        Self {
            max_waiting: config.max_waiting,
            max_avg_query_time_ms: config.max_avg_query_time_ms,
            max_errors: config.max_errors,
        }
    }
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self::from(&HealthConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum HealthWarning {
    /// Too many callers waiting for a connection
    PoolContention { waiting: u32, threshold: u32 },
    /// Average query time above threshold
    HighLatency { avg_query_time_ms: f64, threshold_ms: f64 },
    /// Cumulative error count above threshold
    ErrorRate { errors: u64, threshold: u64 },
}

impl fmt::Display for HealthWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthWarning::PoolContention { waiting, threshold } => write!(
                f,
                "{waiting} callers waiting for a connection (threshold {threshold})"
            ),
            HealthWarning::HighLatency {
                avg_query_time_ms,
                threshold_ms,
            } => write!(
                f,
                "average query time {avg_query_time_ms:.1}ms (threshold {threshold_ms:.1}ms)"
            ),
            HealthWarning::ErrorRate { errors, threshold } => {
                write!(f, "{errors} query errors (threshold {threshold})")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub metrics: QueryMetrics,
    pub warnings: Vec<HealthWarning>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Compare a snapshot against thresholds.
pub fn evaluate(metrics: &QueryMetrics, thresholds: &HealthThresholds) -> Vec<HealthWarning> {
    let mut warnings = Vec::new();

    if metrics.pool_status.waiting_count > thresholds.max_waiting {
        warnings.push(HealthWarning::PoolContention {
            waiting: metrics.pool_status.waiting_count,
            threshold: thresholds.max_waiting,
        });
    }
    if metrics.avg_query_time_ms > thresholds.max_avg_query_time_ms {
        warnings.push(HealthWarning::HighLatency {
            avg_query_time_ms: metrics.avg_query_time_ms,
            threshold_ms: thresholds.max_avg_query_time_ms,
        });
    }
    if metrics.errors > thresholds.max_errors {
        warnings.push(HealthWarning::ErrorRate {
            errors: metrics.errors,
            threshold: thresholds.max_errors,
        });
    }

    warnings
}

pub struct HealthMonitor {
    source: Arc<dyn MetricsSource>,
    thresholds: HealthThresholds,
    interval: Duration,
}

impl fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("thresholds", &self.thresholds)
            .field("interval", &self.interval)
            .finish()
    }
}

impl HealthMonitor {
    pub fn new(source: Arc<dyn MetricsSource>, config: &HealthConfig) -> Self {
        Self {
            source,
            thresholds: HealthThresholds::from(config),
            interval: config.interval(),
        }
    }

    pub fn thresholds(&self) -> &HealthThresholds {
        &self.thresholds
    }

    /// Take one snapshot, log it and log a warning per crossed threshold.
    pub fn tick(&self) -> HealthReport {
        let metrics = self.source.metrics();
        let warnings = evaluate(&metrics, &self.thresholds);

        info!(
            active_connections = metrics.active_connections,
            total_queries = metrics.total_queries,
            slow_queries = metrics.slow_queries,
            errors = metrics.errors,
            avg_query_time_ms = metrics.avg_query_time_ms,
            pool_total = metrics.pool_status.total_count,
            pool_idle = metrics.pool_status.idle_count,
            pool_waiting = metrics.pool_status.waiting_count,
            "📊 Database health snapshot"
        );
        for warning in &warnings {
            warn!(warning = %warning, "⚠️ Database health threshold exceeded");
        }

        HealthReport {
            metrics,
            warnings,
            checked_at: Utc::now(),
        }
    }

    /// Run [`tick`](Self::tick) every interval until `shutdown` is cancelled.
    ///
    /// The first tick happens one interval after spawning.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            max_waiting = self.thresholds.max_waiting,
            max_avg_query_time_ms = self.thresholds.max_avg_query_time_ms,
            max_errors = self.thresholds.max_errors,
            "Starting database health monitor"
        );

        tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + self.interval, self.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Database health monitor stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        self.tick();
                    }
                }
            }
        })
    }
}
